//! Board reader task.
//!
//! One reader per enabled board. It owns the serial connection, groups lines
//! into blocks according to the board family's framing and stores each
//! finished block as a [`Sample`].
//!
//! ```text
//! Closed -> Opening -> Listening -> (Capturing <-> Listening) -> Closed
//! ```
//!
//! Only a failed open ends a reader early. Read errors and EOF back off and
//! retry on the same connection; malformed lines and lines longer than
//! [`MAX_LINE_BYTES`] are dropped.

use super::{BoardFamily, BoardStatus, PortOpener};
use crate::controller::StopSignal;
use crate::parser::{self, LineKind, UnitPolicy};
use crate::sample::{BatteryReading, Sample};
use crate::store::{SampleStore, StatusBoard};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

/// Longest line kept. Anything longer is dropped up to its newline.
pub const MAX_LINE_BYTES: usize = 4096;

/// Everything a reader needs to know about its board.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Board id, e.g. `B1`
    pub board_id: String,
    /// Serial endpoint, e.g. `/dev/ttyUSB0`
    pub port: String,
    /// Framing and normalization rules
    pub family: BoardFamily,
    /// Baud rate used to open the port
    pub baud_rate: u32,
    /// Delay after opening (boards reset on connect)
    pub settle: Duration,
    /// Pause after each finished block
    pub interval: Duration,
    /// Upper bound on a single read
    pub read_timeout: Duration,
    /// Pause after a read error or EOF
    pub read_backoff: Duration,
    /// Label and unit normalization
    pub policy: UnitPolicy,
}

/// Line-to-block state machine, independent of any I/O.
#[derive(Debug)]
pub(crate) struct BlockAssembler {
    board_id: String,
    family: BoardFamily,
    policy: UnitPolicy,
    in_block: bool,
    lines: Vec<String>,
    battery: Option<BatteryReading>,
    battery_pending: bool,
}

impl BlockAssembler {
    pub(crate) fn new(board_id: &str, family: BoardFamily, policy: UnitPolicy) -> Self {
        Self {
            board_id: board_id.to_string(),
            family,
            policy,
            in_block: false,
            lines: Vec::new(),
            battery: None,
            battery_pending: false,
        }
    }

    /// Feed one sanitized line. Returns the lines of a block that just
    /// completed; the caller finalizes it and paces before reading on.
    pub(crate) fn feed(&mut self, line: &str) -> Option<Vec<String>> {
        match parser::classify(self.family, line) {
            LineKind::Empty => None,
            LineKind::Battery(reading) => {
                self.battery = Some(reading);
                self.battery_pending = true;
                None
            }
            LineKind::BlockStart => {
                let done = (!self.lines.is_empty()).then(|| std::mem::take(&mut self.lines));
                self.in_block = true;
                done
            }
            LineKind::BlockEnd => {
                if self.in_block {
                    self.in_block = false;
                    Some(std::mem::take(&mut self.lines))
                } else {
                    None
                }
            }
            LineKind::Data(line) => {
                if self.in_block {
                    self.lines.push(line);
                }
                None
            }
        }
    }

    /// Parse a completed block into a sample.
    ///
    /// `None` when the block has no measurements and no new battery reading.
    pub(crate) fn finalize(&mut self, lines: &[String], now: DateTime<Local>) -> Option<Sample> {
        let measurements: Vec<_> = lines
            .iter()
            .filter_map(|line| parser::parse_measurement(line))
            .map(|m| self.policy.apply(m))
            .collect();

        if measurements.is_empty() && !self.battery_pending {
            return None;
        }
        self.battery_pending = false;
        Some(Sample::new(&self.board_id, now, measurements, self.battery))
    }

    /// Flush on shutdown: a partial block, or a battery reading no block has
    /// carried yet.
    pub(crate) fn drain(&mut self, now: DateTime<Local>) -> Option<Sample> {
        self.in_block = false;
        let lines = std::mem::take(&mut self.lines);
        if lines.is_empty() && !self.battery_pending {
            return None;
        }
        self.finalize(&lines, now)
    }
}

/// Run one board reader until `stop` fires.
pub async fn run_reader(
    opener: Arc<dyn PortOpener>,
    config: ReaderConfig,
    store: Arc<SampleStore>,
    status: Arc<StatusBoard>,
    mut stop: StopSignal,
) {
    let board = config.board_id.as_str();
    status.set(board, BoardStatus::Starting);

    let opened = tokio::select! {
        _ = stop.stopped() => {
            info!(board, port = %config.port, "Stopped while opening board port");
            return;
        }
        opened = opener.open(&config.port, config.baud_rate) => opened,
    };
    let port = match opened {
        Ok(port) => port,
        Err(e) => {
            warn!(board, port = %config.port, error = %e, "Failed to open board port");
            status.set(board, BoardStatus::OpenFailed(e.to_string()));
            return;
        }
    };
    if stop.is_stopped() {
        return;
    }

    if !config.settle.is_zero() && stop.sleep(config.settle).await {
        return;
    }
    status.set(board, BoardStatus::Listening);
    info!(board, port = %config.port, family = %config.family, "Board reader listening");

    let mut assembler = BlockAssembler::new(board, config.family, config.policy.clone());
    let mut port = BufReader::new(port);
    let mut raw: Vec<u8> = Vec::with_capacity(256);
    let mut discarding = false;

    loop {
        // `read_until` keeps partial bytes in `raw` if it is cancelled, so a
        // line split across a timeout is still read whole.
        let mut limited = (&mut port).take(MAX_LINE_BYTES.saturating_sub(raw.len()) as u64);
        let read = tokio::select! {
            _ = stop.stopped() => break,
            read = tokio::time::timeout(config.read_timeout, limited.read_until(b'\n', &mut raw)) => read,
        };

        match read {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => {
                debug!(board, "End of stream; retrying");
                if stop.sleep(config.read_backoff).await {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(board, error = %e, "Serial read failed; retrying");
                raw.clear();
                if stop.sleep(config.read_backoff).await {
                    break;
                }
                continue;
            }
            Ok(Ok(_)) => {}
        }

        let complete = raw.last() == Some(&b'\n');
        if !complete && raw.len() >= MAX_LINE_BYTES {
            if !discarding {
                warn!(board, limit = MAX_LINE_BYTES, "Line exceeds length limit; discarding it");
            }
            discarding = true;
            raw.clear();
            continue;
        }
        if discarding {
            // tail of the over-long line
            discarding = !complete;
            raw.clear();
            continue;
        }

        let line = parser::sanitize_bytes(&raw);
        raw.clear();
        if line.is_empty() {
            continue;
        }

        if let Some(block) = assembler.feed(&line) {
            if let Some(sample) = assembler.finalize(&block, Local::now()) {
                debug!(board, measurements = sample.measurements.len(), "Block stored");
                store.put(sample);
                status.set(board, BoardStatus::Capturing);
            }
            if stop.sleep(config.interval).await {
                break;
            }
        }
    }

    drop(port);

    if let Some(sample) = assembler.drain(Local::now()) {
        debug!(board, "Flushing final block");
        store.put(sample);
        status.set(board, BoardStatus::Capturing);
    }
    info!(board, "Board reader stopped");
}
