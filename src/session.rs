//! Capture requests and the immutable session derived from them.

use crate::board::BoardFamily;
use crate::error::{AppResult, CaptureError};
use crate::sample::REMOTE_TIMESTAMP_FORMAT;
use crate::storage::paths::{self, FamilyPaths};
use crate::storage::remote::encode_key;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Experimental stage of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Bench testing
    Testing,
    /// Controlled experiment
    Experiment,
    /// Field deployment
    Deployment,
    /// Clean-air baseline; has no substance
    Baseline,
}

impl Stage {
    /// One-letter prefix of session file names.
    pub fn prefix(self) -> &'static str {
        match self {
            Stage::Testing => "T",
            Stage::Experiment => "E",
            Stage::Deployment => "D",
            Stage::Baseline => "B",
        }
    }

    /// Folder and remote path segment.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Testing => "Testing",
            Stage::Experiment => "Experiment",
            Stage::Deployment => "Deployment",
            Stage::Baseline => "Baseline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testing" | "t" => Ok(Stage::Testing),
            "experiment" | "e" => Ok(Stage::Experiment),
            "deployment" | "d" => Ok(Stage::Deployment),
            "baseline" | "b" => Ok(Stage::Baseline),
            other => Err(CaptureError::InvalidRequest(format!(
                "unknown stage '{other}'; expected Testing, Experiment, Deployment or Baseline"
            ))),
        }
    }
}

/// What the presentation layer asks for when starting a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Experimental stage
    pub stage: Stage,
    /// Substance under test; ignored for [`Stage::Baseline`]
    pub substance: Option<String>,
    /// Remote test identifier; generated with [`make_test_id`] when absent
    pub test_id: Option<String>,
    /// Gas flow rate in L/min, copied into every row
    pub flowrate: f64,
    /// Auto-stop after this long, measured from the first reading
    pub duration: Option<Duration>,
    /// Pause between blocks and between written rows
    pub interval: Duration,
    /// Serial endpoint by board id; blank endpoints disable the board
    pub ports: BTreeMap<String, String>,
    /// Family overrides by board id; others are inferred from the id
    pub families: BTreeMap<String, BoardFamily>,
}

impl CaptureRequest {
    /// Request without boards; add them with [`CaptureRequest::with_port`].
    pub fn new(stage: Stage, substance: Option<&str>, flowrate: f64, interval: Duration) -> Self {
        Self {
            stage,
            substance: substance.map(str::to_string),
            test_id: None,
            flowrate,
            duration: None,
            interval,
            ports: BTreeMap::new(),
            families: BTreeMap::new(),
        }
    }

    /// Enable `board_id` on `port`.
    pub fn with_port(mut self, board_id: &str, port: &str) -> Self {
        self.ports.insert(board_id.to_string(), port.to_string());
        self
    }

    /// Force the family of `board_id`.
    pub fn with_family(mut self, board_id: &str, family: BoardFamily) -> Self {
        self.families.insert(board_id.to_string(), family);
        self
    }

    /// Stop automatically `duration` after the first reading.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Use an explicit remote test id.
    pub fn with_test_id(mut self, test_id: &str) -> Self {
        self.test_id = Some(test_id.to_string());
        self
    }

    /// Enabled boards with their endpoint and family.
    pub fn enabled_boards(&self) -> BTreeMap<String, BoardSpec> {
        self.ports
            .iter()
            .map(|(id, port)| (id.trim(), port.trim()))
            .filter(|(id, port)| !id.is_empty() && !port.is_empty())
            .map(|(id, port)| {
                let family = self
                    .families
                    .get(id)
                    .copied()
                    .unwrap_or_else(|| BoardFamily::for_board_id(id));
                (
                    id.to_string(),
                    BoardSpec {
                        port: port.to_string(),
                        family,
                    },
                )
            })
            .collect()
    }

    /// Reject requests that cannot describe a session.
    pub fn validate(&self) -> AppResult<()> {
        if self.enabled_boards().is_empty() {
            return Err(CaptureError::InvalidRequest(
                "no boards enabled; give at least one board a port".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(CaptureError::InvalidRequest(
                "interval must be positive".to_string(),
            ));
        }
        if !self.flowrate.is_finite() {
            return Err(CaptureError::InvalidRequest(format!(
                "flowrate must be a finite number, got {}",
                self.flowrate
            )));
        }
        if self.stage != Stage::Baseline
            && self.substance.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(CaptureError::InvalidRequest(format!(
                "a substance is required for stage {}",
                self.stage
            )));
        }
        Ok(())
    }
}

/// Endpoint and family of one enabled board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSpec {
    /// Serial endpoint
    pub port: String,
    /// Wire protocol
    pub family: BoardFamily,
}

/// One capture run. Immutable once created.
#[derive(Debug, Clone)]
pub struct Session {
    /// Experimental stage
    pub stage: Stage,
    /// Title-cased substance; `None` iff the stage is Baseline
    pub substance: Option<String>,
    /// Remote test identifier
    pub test_id: String,
    /// Flow rate copied into rows
    pub flowrate: f64,
    /// Pause between blocks and between rows
    pub interval: Duration,
    /// Auto-stop duration
    pub duration: Option<Duration>,
    /// Enabled boards
    pub boards: BTreeMap<String, BoardSpec>,
    /// Output files per family that has enabled boards
    pub outputs: BTreeMap<BoardFamily, FamilyPaths>,
    /// Remote prefix `<stage>/<substance>/<test_id>`
    pub remote_base_path: String,
}

impl Session {
    /// Derive a session from a validated request, creating the output folder.
    pub fn from_request(request: &CaptureRequest, root: &Path, now: DateTime<Local>) -> AppResult<Self> {
        request.validate()?;

        let substance = match request.stage {
            Stage::Baseline => None,
            _ => request.substance.as_deref().map(paths::title_case),
        };
        let boards = request.enabled_boards();

        let mut outputs = BTreeMap::new();
        for spec in boards.values() {
            if !outputs.contains_key(&spec.family) {
                let family_paths =
                    paths::family_paths(root, request.stage, substance.as_deref(), spec.family)?;
                outputs.insert(spec.family, family_paths);
            }
        }

        let test_id = request
            .test_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| make_test_id(request.stage, substance.as_deref(), now));

        let remote_base_path = [
            request.stage.name(),
            substance.as_deref().unwrap_or(paths::BASELINE_SUBSTANCE),
            test_id.as_str(),
        ]
        .iter()
        .map(|segment| encode_key(segment))
        .collect::<Vec<_>>()
        .join("/");

        Ok(Self {
            stage: request.stage,
            substance,
            test_id,
            flowrate: request.flowrate,
            interval: request.interval,
            duration: request.duration.filter(|d| !d.is_zero()),
            boards,
            outputs,
            remote_base_path,
        })
    }

    /// Enabled boards of one family, in id order.
    pub fn boards_of(&self, family: BoardFamily) -> Vec<String> {
        self.boards
            .iter()
            .filter(|(_, spec)| spec.family == family)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Default remote test id: `<prefix>_<substance>_<HH-MM-SS DD-MM-YYYY>`.
pub fn make_test_id(stage: Stage, substance: Option<&str>, now: DateTime<Local>) -> String {
    format!(
        "{}_{}_{}",
        stage.prefix(),
        substance.unwrap_or(paths::BASELINE_SUBSTANCE),
        now.format(REMOTE_TIMESTAMP_FORMAT)
    )
}
