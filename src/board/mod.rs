//! Board families, per-board status and the serial opener seam.
//!
//! A board is identified by a short id (`B1`, `LB2`, ...). Its family decides
//! the baud rate, the block framing and how labels and units are normalized.

pub mod reader;
pub mod serial;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use serial::{DynSerial, SerialOpener, SerialPortIO};

/// Wire protocol spoken by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardFamily {
    /// `new data` ... `*` framing, 9600 baud
    Standard,
    /// `new data` framing with out-of-band battery lines, 115200 baud
    Libelium,
}

impl BoardFamily {
    /// Infer the family from a board id: `LB*` is Libelium, anything else Standard.
    pub fn for_board_id(board_id: &str) -> Self {
        if board_id.trim().to_ascii_uppercase().starts_with("LB") {
            BoardFamily::Libelium
        } else {
            BoardFamily::Standard
        }
    }

    /// Suffix of this family's output files (`B` or `LB`).
    pub fn file_suffix(self) -> &'static str {
        match self {
            BoardFamily::Standard => "B",
            BoardFamily::Libelium => "LB",
        }
    }

    /// Whether rows of this family carry battery columns.
    pub fn has_battery(self) -> bool {
        self == BoardFamily::Libelium
    }
}

impl fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardFamily::Standard => write!(f, "standard"),
            BoardFamily::Libelium => write!(f, "libelium"),
        }
    }
}

/// Lifecycle state of one board reader, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BoardStatus {
    /// Enabled but not yet started
    #[default]
    Idle,
    /// Opening the port
    Starting,
    /// Port open, waiting for a block
    Listening,
    /// At least one sample stored
    Capturing,
    /// The port could not be opened; the reader has ended
    OpenFailed(String),
    /// Any other terminal problem (e.g. the reader did not stop in time)
    Error(String),
}

impl BoardStatus {
    /// True for the two error states.
    pub fn is_error(&self) -> bool {
        matches!(self, BoardStatus::OpenFailed(_) | BoardStatus::Error(_))
    }
}

impl fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardStatus::Idle => write!(f, "idle"),
            BoardStatus::Starting => write!(f, "starting"),
            BoardStatus::Listening => write!(f, "listening"),
            BoardStatus::Capturing => write!(f, "capturing"),
            BoardStatus::OpenFailed(detail) => write!(f, "error open: {detail}"),
            BoardStatus::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

/// Opens the byte stream of one board.
///
/// The production implementation is [`SerialOpener`]; tests hand out
/// in-memory `tokio::io::duplex` halves instead.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud_rate`.
    async fn open(&self, port: &str, baud_rate: u32) -> AppResult<DynSerial>;
}
