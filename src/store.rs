//! Shared session state: the latest sample per board and per-board status.
//!
//! Both tables sit behind a `std::sync::Mutex` each. Critical sections only
//! clone or swap small values and never await or do I/O.

use crate::board::BoardStatus;
use crate::sample::Sample;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct StoreInner {
    latest: HashMap<String, Arc<Sample>>,
    first_reading_at: Option<Instant>,
}

/// Latest sample per board plus the instant the session's first sample arrived.
#[derive(Debug, Default)]
pub struct SampleStore {
    inner: Mutex<StoreInner>,
}

impl SampleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored sample for `sample.board_id`.
    pub fn put(&self, sample: Sample) {
        let mut inner = lock(&self.inner);
        inner.first_reading_at.get_or_insert_with(Instant::now);
        inner.latest.insert(sample.board_id.clone(), Arc::new(sample));
    }

    /// Latest sample for `board_id`.
    pub fn get(&self, board_id: &str) -> Option<Arc<Sample>> {
        lock(&self.inner).latest.get(board_id).cloned()
    }

    /// Latest samples for the given boards; boards without one are omitted.
    pub fn latest_for<S: AsRef<str>>(&self, board_ids: &[S]) -> BTreeMap<String, Arc<Sample>> {
        let inner = lock(&self.inner);
        board_ids
            .iter()
            .filter_map(|id| {
                inner
                    .latest
                    .get(id.as_ref())
                    .map(|s| (id.as_ref().to_string(), Arc::clone(s)))
            })
            .collect()
    }

    /// True iff every listed board has a stored sample.
    pub fn all_reporting<S: AsRef<str>>(&self, board_ids: &[S]) -> bool {
        let inner = lock(&self.inner);
        board_ids.iter().all(|id| inner.latest.contains_key(id.as_ref()))
    }

    /// True iff at least one listed board has a stored sample.
    pub fn any_reporting<S: AsRef<str>>(&self, board_ids: &[S]) -> bool {
        let inner = lock(&self.inner);
        board_ids.iter().any(|id| inner.latest.contains_key(id.as_ref()))
    }

    /// When the first sample of the session was stored.
    pub fn first_reading_at(&self) -> Option<Instant> {
        lock(&self.inner).first_reading_at
    }

    /// Forget every sample and the first-reading instant.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.latest.clear();
        inner.first_reading_at = None;
    }
}

#[derive(Debug, Default)]
struct StatusInner {
    boards: BTreeMap<String, BoardStatus>,
    remote: String,
    files: BTreeMap<String, PathBuf>,
}

/// Per-board status strings, the remote mirror's status and the output files
/// currently written to.
///
/// Keys are exactly the boards enabled by the last [`StatusBoard::reset`].
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<StatusInner>,
}

impl StatusBoard {
    /// Create an empty status board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session: every enabled board becomes `idle`.
    pub fn reset<I, S>(&self, enabled: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = lock(&self.inner);
        inner.boards = enabled
            .into_iter()
            .map(|id| (id.into(), BoardStatus::Idle))
            .collect();
        inner.remote = "uninitialized".to_string();
        inner.files.clear();
    }

    /// Update one board. Unknown boards are ignored.
    pub fn set(&self, board_id: &str, status: BoardStatus) {
        if let Some(slot) = lock(&self.inner).boards.get_mut(board_id) {
            *slot = status;
        }
    }

    /// Current status of one board.
    pub fn get(&self, board_id: &str) -> Option<BoardStatus> {
        lock(&self.inner).boards.get(board_id).cloned()
    }

    /// Update the remote mirror status.
    pub fn set_remote(&self, status: impl Into<String>) {
        lock(&self.inner).remote = status.into();
    }

    /// Current remote mirror status.
    pub fn remote(&self) -> String {
        lock(&self.inner).remote.clone()
    }

    /// Record the file an output is written to, e.g. `Session CSV (B)`.
    pub fn set_file(&self, label: impl Into<String>, path: &Path) {
        lock(&self.inner).files.insert(label.into(), path.to_path_buf());
    }

    /// Output files by label.
    pub fn files(&self) -> BTreeMap<String, PathBuf> {
        lock(&self.inner).files.clone()
    }

    /// `"<board>: <status>"` for every enabled board in id order,
    /// `"Firebase: <status>"`, then `"<label>: <path>"` per output file.
    pub fn lines(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let boards = inner
            .boards
            .iter()
            .map(|(id, status)| format!("{id}: {status}"));
        let files = inner
            .files
            .iter()
            .map(|(label, path)| format!("{label}: {}", path.display()));
        boards
            .chain(std::iter::once(format!("Firebase: {}", inner.remote)))
            .chain(files)
            .collect()
    }
}
