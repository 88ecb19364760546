//! Persistence writer task.
//!
//! One writer per board family with enabled boards. It primes the remote
//! sequence counters, freezes the header, then on every interval tick appends
//! the next synchronized row to the session and cumulative files and mirrors
//! the fresh per-board samples. A final flush runs when stopped.

use super::csv_sink::CsvSink;
use super::paths::FamilyPaths;
use super::remote::RemoteMirror;
use crate::board::BoardFamily;
use crate::config::FamilyConfig;
use crate::controller::StopSignal;
use crate::store::{SampleStore, StatusBoard};
use crate::sync::{HeaderBuilder, RowSynchronizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Everything one family's writer needs.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Family whose boards this writer covers
    pub family: BoardFamily,
    /// Enabled boards of the family
    pub boards: Vec<String>,
    /// Expected sensors and unit defaults
    pub family_config: FamilyConfig,
    /// Output files
    pub paths: FamilyPaths,
    /// Flow rate copied into rows
    pub flowrate: f64,
    /// Tick period
    pub interval: Duration,
    /// Upper bound on waiting for every board before freezing the header
    pub header_wait: Duration,
    /// Poll period while waiting for the header
    pub poll: Duration,
}

struct FamilyWriter {
    family: BoardFamily,
    sync: RowSynchronizer,
    session: CsvSink,
    cumulative: CsvSink,
    session_label: String,
    cumulative_label: String,
    rows: u64,
}

impl FamilyWriter {
    /// Persist the next row, if any. Local failures are logged and the row
    /// is lost only for the file that failed.
    async fn tick(&mut self, store: &SampleStore, status: &StatusBoard, mirror: &Mutex<RemoteMirror>) {
        let Some(synced) = self.sync.next_row(store) else {
            return;
        };
        let header = self.sync.header();

        for (sink, label) in [
            (&mut self.session, &self.session_label),
            (&mut self.cumulative, &self.cumulative_label),
        ] {
            let was_diverted = sink.is_diverted();
            if let Err(e) = sink.append(header, &synced.row) {
                warn!(family = %self.family, path = %sink.path().display(), error = %e, "Failed to append row");
            }
            if sink.is_diverted() && !was_diverted {
                status.set_file(label.as_str(), sink.path());
            }
        }
        self.rows += 1;
        debug!(family = %self.family, timestamp = %synced.row.timestamp, fresh = synced.fresh.len(), "Row written");

        let mut mirror = mirror.lock().await;
        for sample in &synced.fresh {
            mirror.mirror(sample, header).await;
        }
    }
}

/// Run one family writer until `stop` fires, then flush once more.
pub async fn run_writer(
    config: WriterConfig,
    store: Arc<SampleStore>,
    status: Arc<StatusBoard>,
    mirror: Arc<Mutex<RemoteMirror>>,
    mut stop: StopSignal,
) {
    let family = config.family;
    mirror.lock().await.prime(&config.boards).await;

    let builder = HeaderBuilder::new(family, &config.boards, &config.family_config);
    let Some(header) = builder
        .wait_and_build(&store, &status, config.header_wait, config.poll, &mut stop)
        .await
    else {
        info!(%family, "Stopped before any board reported; nothing written");
        return;
    };
    info!(%family, columns = header.columns().len(), path = %config.paths.session_file.display(), "Writer started");

    let mut writer = FamilyWriter {
        family,
        sync: RowSynchronizer::new(header, &config.boards, config.flowrate),
        session: CsvSink::new(&config.paths.session_file),
        cumulative: CsvSink::new(&config.paths.cumulative_file),
        session_label: config.paths.session_label(),
        cumulative_label: config.paths.cumulative_label(),
        rows: 0,
    };

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => writer.tick(&store, &status, &mirror).await,
        }
    }

    // Readers have been joined by now; pick up their final blocks.
    writer.tick(&store, &status, &mirror).await;
    info!(%family, rows = writer.rows, "Writer stopped");
}
