//! Capture session controller.
//!
//! Owns the lifecycle of one capture session at a time:
//!
//! 1. **start**: validate the request, stop any running session, create fresh
//!    session state, derive paths, spawn one reader per board, one writer per family
//!    and, if a duration is set, the auto-stop watcher
//! 2. **stop**: signal readers and join each within the grace period, then
//!    signal writers (which flush once more) and join them the same way
//! 3. **snapshot**: progress, status lines and file paths for the UI
//!
//! Tasks that miss the grace period are abandoned, not aborted; an abandoned
//! reader's status says so.
//!
//! # Example
//! ```no_run
//! use enose_capture::{config::AppConfig, CaptureController, CaptureRequest, Stage};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let controller = CaptureController::new(AppConfig::load()?);
//! let request = CaptureRequest::new(Stage::Testing, Some("acetone"), 1.5, Duration::from_secs(1))
//!     .with_port("B1", "/dev/ttyUSB0");
//! controller.start_capture(request).await?;
//! for line in controller.snapshot().status_lines {
//!     println!("{line}");
//! }
//! controller.stop_capture().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use crate::board::reader::{run_reader, ReaderConfig};
use crate::board::{BoardStatus, PortOpener, SerialOpener};
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::parser::UnitPolicy;
use crate::sample::Sample;
use crate::session::{CaptureRequest, Session};
use crate::storage::remote::{RemoteCapability, RemoteMirror};
use crate::storage::writer::{run_writer, WriterConfig};
use crate::store::{SampleStore, StatusBoard};
use chrono::Local;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Sending half of a stop signal. Dropping it also counts as stop.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    /// New, not yet signalled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A receiver to hand to a task.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Ask every task holding a signal to stop.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Cooperative cancellation observed by reader and writer tasks.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop is requested (or the handle is gone).
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `true` if stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }
}

/// What the UI shows while a capture runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSnapshot {
    /// A session is running
    pub active: bool,
    /// Elapsed share of the configured duration since the first reading, 0-100
    pub progress_pct: f64,
    /// `"<board>: <status>"`, `"Firebase: <status>"` and output file lines
    pub status_lines: Vec<String>,
    /// Output files by label, e.g. `Session CSV (B)`
    pub file_paths: BTreeMap<String, PathBuf>,
}

/// Samples and status lines owned by one session.
///
/// Fresh per session. Tasks abandoned by an earlier session only ever see
/// their own copies.
#[derive(Clone)]
struct SessionState {
    session: Arc<Session>,
    store: Arc<SampleStore>,
    status: Arc<StatusBoard>,
}

struct ActiveSession {
    generation: u64,
    state: SessionState,
    reader_stop: StopHandle,
    writer_stop: StopHandle,
    readers: Vec<(String, JoinHandle<()>)>,
    writers: Vec<(String, JoinHandle<()>)>,
}

struct Inner {
    config: AppConfig,
    opener: Arc<dyn PortOpener>,
    remote: StdMutex<RemoteCapability>,
    active: Mutex<Option<ActiveSession>>,
    current: StdMutex<Option<(SessionState, bool)>>,
    generation: AtomicU64,
    running_generation: AtomicU64,
}

/// Public entry point for the presentation layer. Cheap to clone.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CaptureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureController")
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CaptureController {
    /// Controller opening real serial ports.
    pub fn new(config: AppConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialOpener))
    }

    /// Controller using a custom port opener.
    pub fn with_opener(config: AppConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                opener,
                remote: StdMutex::new(RemoteCapability::Uninitialized),
                active: Mutex::new(None),
                current: StdMutex::new(None),
                generation: AtomicU64::new(0),
                running_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Use `capability` instead of resolving it from configuration.
    pub fn with_remote(self, capability: RemoteCapability) -> Self {
        *self
            .inner
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capability;
        self
    }

    /// Start a capture, stopping any running one first.
    ///
    /// Only request validation and output-folder creation can fail; board and
    /// remote problems surface in [`CaptureController::snapshot`].
    pub async fn start_capture(&self, request: CaptureRequest) -> AppResult<()> {
        request.validate()?;
        let inner = &self.inner;

        let mut active = inner.active.lock().await;
        if let Some(previous) = active.take() {
            info!("Stopping previous session before starting a new one");
            self.shutdown(previous).await;
        }

        let session = Arc::new(Session::from_request(
            &request,
            &inner.config.capture.output_dir,
            Local::now(),
        )?);

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let store = Arc::new(SampleStore::new());
        let status = Arc::new(StatusBoard::new());
        status.reset(session.boards.keys().cloned());
        for paths in session.outputs.values() {
            status.set_file(paths.session_label(), &paths.session_file);
            status.set_file(paths.cumulative_label(), &paths.cumulative_file);
        }

        let mirror = Arc::new(Mutex::new(RemoteMirror::new(
            self.remote_capability(),
            session.remote_base_path.clone(),
            inner.config.remote.error_budget,
            Arc::clone(&status),
        )));

        let capture = &inner.config.capture;
        let reader_stop = StopHandle::new();
        let writer_stop = StopHandle::new();

        let readers = session
            .boards
            .iter()
            .map(|(board_id, spec)| {
                let family_config = inner.config.families.get(spec.family);
                let reader_config = ReaderConfig {
                    board_id: board_id.clone(),
                    port: spec.port.clone(),
                    family: spec.family,
                    baud_rate: family_config.baud_rate,
                    settle: family_config.settle(),
                    interval: session.interval,
                    read_timeout: capture.read_timeout(),
                    read_backoff: capture.read_backoff(),
                    policy: UnitPolicy::for_family(spec.family, family_config),
                };
                let handle = tokio::spawn(run_reader(
                    Arc::clone(&inner.opener),
                    reader_config,
                    Arc::clone(&store),
                    Arc::clone(&status),
                    reader_stop.signal(),
                ));
                (board_id.clone(), handle)
            })
            .collect();

        let writers = session
            .outputs
            .iter()
            .map(|(family, paths)| {
                let writer_config = WriterConfig {
                    family: *family,
                    boards: session.boards_of(*family),
                    family_config: inner.config.families.get(*family).clone(),
                    paths: paths.clone(),
                    flowrate: session.flowrate,
                    interval: session.interval,
                    header_wait: capture.header_wait(),
                    poll: capture.watcher_poll(),
                };
                let handle = tokio::spawn(run_writer(
                    writer_config,
                    Arc::clone(&store),
                    Arc::clone(&status),
                    Arc::clone(&mirror),
                    writer_stop.signal(),
                ));
                (format!("writer ({family})"), handle)
            })
            .collect();

        inner.running_generation.store(generation, Ordering::SeqCst);
        if let Some(duration) = session.duration {
            tokio::spawn(auto_stop_watcher(
                self.clone(),
                Arc::clone(&store),
                generation,
                duration,
                capture.watcher_poll(),
            ));
        }

        info!(
            stage = %session.stage,
            substance = session.substance.as_deref().unwrap_or("-"),
            test_id = %session.test_id,
            boards = session.boards.len(),
            "Capture started"
        );
        let state = SessionState {
            session,
            store,
            status,
        };
        self.set_current(Some((state.clone(), true)));
        *active = Some(ActiveSession {
            generation,
            state,
            reader_stop,
            writer_stop,
            readers,
            writers,
        });
        Ok(())
    }

    /// Stop the running session, if any. Idempotent.
    pub async fn stop_capture(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(session) = active.take() {
            self.shutdown(session).await;
        }
    }

    /// Stop the session only if it is still `generation`.
    async fn stop_generation(&self, generation: u64) {
        let mut active = self.inner.active.lock().await;
        if active.as_ref().map(|s| s.generation) == Some(generation) {
            if let Some(session) = active.take() {
                self.shutdown(session).await;
            }
        }
    }

    async fn shutdown(&self, active: ActiveSession) {
        let inner = &self.inner;
        let grace = inner.config.capture.join_timeout();
        let status = &active.state.status;
        inner.running_generation.store(0, Ordering::SeqCst);

        active.reader_stop.stop();
        for (board, handle) in active.readers {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(board = %board, error = %e, "Board reader panicked");
                    status.set(&board, BoardStatus::Error(format!("reader failed: {e}")));
                }
                Err(_) => {
                    warn!(board = %board, "Board reader did not stop within {:?}; abandoning it", grace);
                    status.set(
                        &board,
                        BoardStatus::Error(format!("did not stop within {:.1}s", grace.as_secs_f64())),
                    );
                }
            }
        }

        active.writer_stop.stop();
        for (name, handle) in active.writers {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %name, error = %e, "Writer panicked"),
                Err(_) => warn!(task = %name, "Writer did not stop within {:?}; abandoning it", grace),
            }
        }

        self.set_current(Some((active.state, false)));
        info!(generation = active.generation, "Capture stopped");
    }

    fn set_current(&self, value: Option<(SessionState, bool)>) {
        *self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn remote_capability(&self) -> RemoteCapability {
        let mut capability = self
            .inner
            .remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(*capability, RemoteCapability::Uninitialized) {
            *capability = RemoteCapability::from_config(&self.inner.config.remote);
        }
        capability.clone()
    }

    /// Progress, status lines and file paths of the current (or last) session.
    pub fn snapshot(&self) -> CaptureSnapshot {
        let Some((state, active)) = self.current() else {
            return CaptureSnapshot {
                active: false,
                progress_pct: 0.0,
                status_lines: Vec::new(),
                file_paths: BTreeMap::new(),
            };
        };

        let progress_pct = match (state.session.duration, state.store.first_reading_at()) {
            (Some(duration), Some(first)) if !duration.is_zero() => {
                (first.elapsed().as_secs_f64() / duration.as_secs_f64() * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };

        CaptureSnapshot {
            active,
            progress_pct,
            status_lines: state.status.lines(),
            file_paths: state.status.files(),
        }
    }

    /// Latest stored sample of `board_id` in the current (or last) session.
    pub fn latest_sample(&self, board_id: &str) -> Option<Arc<Sample>> {
        self.current().and_then(|(state, _)| state.store.get(board_id))
    }

    fn current(&self) -> Option<(SessionState, bool)> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        self.inner.running_generation.load(Ordering::SeqCst) != 0
    }
}

/// Stop session `generation` once `duration` has passed since its first
/// reading. Exits quietly when that session ends some other way.
async fn auto_stop_watcher(
    controller: CaptureController,
    store: Arc<SampleStore>,
    generation: u64,
    duration: Duration,
    poll: Duration,
) {
    loop {
        tokio::time::sleep(poll).await;
        if controller.inner.running_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let Some(first) = store.first_reading_at() else {
            continue;
        };
        if first.elapsed() >= duration {
            info!(generation, "Configured duration reached; stopping capture");
            controller.stop_generation(generation).await;
            return;
        }
    }
}
