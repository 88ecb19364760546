//! Output folder and file naming.
//!
//! ```text
//! <root>/<Stage>/<Substance>/<prefix><Substance><run:04>_<suffix>.csv   session file
//! <root>/<Stage>/<Substance>/<Substance>_<suffix>_Readings.csv         cumulative file
//! <root>/Baseline/baseline/...                                          baseline runs
//! ```

use crate::board::BoardFamily;
use crate::error::AppResult;
use crate::session::Stage;
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};

/// Substance token used for baseline runs.
pub const BASELINE_SUBSTANCE: &str = "baseline";

/// Files one family writes during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyPaths {
    /// Containing folder
    pub folder: PathBuf,
    /// Per-run file
    pub session_file: PathBuf,
    /// File accumulating every run of this substance
    pub cumulative_file: PathBuf,
    /// `B` or `LB`
    pub suffix: &'static str,
}

impl FamilyPaths {
    /// Status label of the session file, e.g. `Session CSV (B)`.
    pub fn session_label(&self) -> String {
        format!("Session CSV ({})", self.suffix)
    }

    /// Status label of the cumulative file, e.g. `Cumulative (B)`.
    pub fn cumulative_label(&self) -> String {
        format!("Cumulative ({})", self.suffix)
    }
}

/// Title-case every alphabetic run: `ethyl acetate` becomes `Ethyl Acetate`.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.trim().chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Folder of a run; `substance` is expected title-cased already.
pub fn folder_for(root: &Path, stage: Stage, substance: Option<&str>) -> PathBuf {
    match (stage, substance) {
        (Stage::Baseline, _) | (_, None) => root.join(Stage::Baseline.name()).join(BASELINE_SUBSTANCE),
        (_, Some(sub)) => root.join(stage.name()).join(sub),
    }
}

/// Create the run folder and pick the next free run number for `family`.
///
/// The run number is one more than the count of `.csv` files in the folder
/// whose name starts with `<prefix><substance>` (case-insensitive) and ends
/// with `_<suffix>.csv`.
pub fn family_paths(
    root: &Path,
    stage: Stage,
    substance: Option<&str>,
    family: BoardFamily,
) -> AppResult<FamilyPaths> {
    let folder = folder_for(root, stage, substance);
    fs::create_dir_all(&folder)?;

    let sub = match stage {
        Stage::Baseline => BASELINE_SUBSTANCE,
        _ => substance.unwrap_or(BASELINE_SUBSTANCE),
    };
    let suffix = family.file_suffix();
    let stem = format!("{}{}", stage.prefix(), sub);
    let stem_lower = stem.to_lowercase();
    let tail_lower = format!("_{suffix}.csv").to_lowercase();

    let mut existing = 0usize;
    for entry in fs::read_dir(&folder)? {
        let name = entry?.file_name().to_string_lossy().to_lowercase();
        if name.starts_with(&stem_lower) && name.ends_with(&tail_lower) {
            existing += 1;
        }
    }
    let run = existing + 1;

    Ok(FamilyPaths {
        session_file: folder.join(format!("{stem}{run:04}_{suffix}.csv")),
        cumulative_file: folder.join(format!("{sub}_{suffix}_Readings.csv")),
        folder,
        suffix,
    })
}

/// Alternate file used when `path` cannot be written:
/// `<stem>_pending_<YYYYmmdd_HHMMSS>.csv` in the same folder.
pub fn pending_path(path: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "readings".to_string());
    let name = format!("{stem}_pending_{}.csv", now.format("%Y%m%d_%H%M%S"));
    path.with_file_name(name)
}
