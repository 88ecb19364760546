//! Append-only CSV target with fallback on write contention.

use super::paths::pending_path;
use crate::error::AppResult;
use crate::sync::{Header, OutputRow};
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Opens a file for appending. Replaceable so tests can simulate a locked file.
pub type OpenForAppend = fn(&Path) -> io::Result<File>;

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// One CSV file a writer appends rows to.
///
/// The header goes in first whenever the file is new or empty. If the file
/// cannot be written because it is locked or read-only, the row goes to a
/// `_pending_` file next to it instead, and that file is used from then on.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    diverted: bool,
    open: OpenForAppend,
}

impl CsvSink {
    /// Sink appending to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_opener(path, open_append)
    }

    /// Sink using a custom open function.
    pub fn with_opener(path: impl Into<PathBuf>, open: OpenForAppend) -> Self {
        Self {
            path: path.into(),
            diverted: false,
            open,
        }
    }

    /// File currently written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes have moved to a pending file.
    pub fn is_diverted(&self) -> bool {
        self.diverted
    }

    /// Append one row, writing the header first if the file is new or empty.
    pub fn append(&mut self, header: &Header, row: &OutputRow) -> AppResult<()> {
        match self.append_to(&self.path, header, row) {
            Ok(()) => Ok(()),
            Err(e) if e.is_write_contention() => {
                let alternate = pending_path(&self.path, Local::now());
                warn!(
                    path = %self.path.display(),
                    alternate = %alternate.display(),
                    error = %e,
                    "CSV file not writable; diverting to pending file"
                );
                self.append_to(&alternate, header, row)?;
                self.path = alternate;
                self.diverted = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn append_to(&self, path: &Path, header: &Header, row: &OutputRow) -> AppResult<()> {
        let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = (self.open)(path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            debug!(path = %path.display(), "Writing CSV header");
            writer.write_record(header.record())?;
        }
        writer.write_record(row.record())?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ColumnKey;

    fn header() -> Header {
        Header::new(vec![
            ColumnKey::labeled("B1", "Temp", Some("°C")),
            ColumnKey::labeled("B2", "Gas", Some("ppm")),
        ])
    }

    fn row(ts: &str, temp: Option<f64>) -> OutputRow {
        OutputRow {
            timestamp: ts.to_string(),
            flowrate: 1.0,
            values: vec![temp, Some(3.2)],
        }
    }

    fn locked_unless_pending(path: &Path) -> io::Result<File> {
        if path.to_string_lossy().contains("_pending_") {
            open_append(path)
        } else {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is locked"))
        }
    }

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TAcetone0001_B.csv");
        let mut sink = CsvSink::new(&path);

        sink.append(&header(), &row("2025-01-01 00:00:01", Some(21.5))).unwrap();
        sink.append(&header(), &row("2025-01-01 00:00:02", None)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Timestamp,Flowrate (L/min),B1 - Temp (°C),B2 - Gas (ppm)\n\
             2025-01-01 00:00:01,1,21.5,3.2\n\
             2025-01-01 00:00:02,1,,3.2\n"
        );
        assert!(!text.starts_with('\u{feff}'));
    }

    #[test]
    fn empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Acetone_B_Readings.csv");
        fs::write(&path, "").unwrap();

        let mut sink = CsvSink::new(&path);
        sink.append(&header(), &row("2025-01-01 00:00:01", Some(1.0))).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with("Timestamp,"));
    }

    #[test]
    fn existing_rows_are_appended_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Acetone_B_Readings.csv");
        fs::write(&path, "Timestamp,Flowrate (L/min),B1 - Temp (°C),B2 - Gas (ppm)\nold\n").unwrap();

        let mut sink = CsvSink::new(&path);
        sink.append(&header(), &row("2025-01-01 00:00:01", Some(1.0))).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("Timestamp").count(), 1);
        assert!(text.ends_with("2025-01-01 00:00:01,1,1,3.2\n"));
    }

    #[test]
    fn permission_denied_diverts_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TAcetone0001_B.csv");
        let mut sink = CsvSink::with_opener(&path, locked_unless_pending);

        sink.append(&header(), &row("2025-01-01 00:00:01", Some(21.5))).unwrap();
        assert!(sink.is_diverted());
        let pending = sink.path().to_path_buf();
        assert!(pending
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("TAcetone0001_B_pending_"));
        assert_eq!(pending.parent(), path.parent());

        sink.append(&header(), &row("2025-01-01 00:00:02", Some(22.0))).unwrap();
        assert_eq!(sink.path(), pending.as_path());

        let text = fs::read_to_string(&pending).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("Timestamp,"));
        assert!(!path.exists());
    }

    #[test]
    fn other_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        // a directory where the file should be
        let path = dir.path().join("TAcetone0001_B.csv");
        fs::create_dir(&path).unwrap();

        let mut sink = CsvSink::new(&path);
        assert!(sink.append(&header(), &row("2025-01-01 00:00:01", None)).is_err());
        assert!(!sink.is_diverted());
    }
}
