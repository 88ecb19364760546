//! Custom error types for the capture core.
//!
//! This module defines the primary error type, `CaptureError`. Using the
//! `thiserror` crate, it provides one place for every failure the public API
//! can surface, from configuration problems to I/O on the output files.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while loading the configuration.
//! - **`InvalidRequest`**: Semantic errors in a capture request (no boards
//!   enabled, non-positive interval, missing substance). This is the only kind
//!   `CaptureController::start_capture` returns to its caller.
//! - **`Io`** / **`Csv`**: Local file errors. The persistence writer handles
//!   these itself (permission errors divert to an alternate file), so they only
//!   escape from the lower-level storage helpers.
//! - **`Serial`**: A port could not be opened. Fatal for that board only; the
//!   reader turns it into a status string.
//! - **`Remote`**: Wraps [`RemoteError`] from the remote mirror.
//!
//! Per-board and per-subsystem failures never propagate to the controller;
//! they are rendered into the status map instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Primary error type for the capture core.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Invalid capture request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),
}

/// Errors from the remote keyed store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0}: {1}")]
    Http(u16, String),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("Remote support not enabled. Rebuild with --features remote_firebase")]
    FeatureDisabled,
}

impl CaptureError {
    /// True when the underlying I/O failure means the destination file is
    /// locked or not writable, which the writer answers with an alternate file.
    pub fn is_write_contention(&self) -> bool {
        let io = match self {
            CaptureError::Io(err) => Some(err),
            CaptureError::Csv(err) => match err.kind() {
                csv::ErrorKind::Io(err) => Some(err),
                _ => None,
            },
            _ => None,
        };
        io.is_some_and(|err| err.kind() == std::io::ErrorKind::PermissionDenied)
    }
}
