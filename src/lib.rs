//! # E-nose Capture Core Library
//!
//! Captures readings from several serial gas-sensor boards at once, merges
//! them into time-aligned rows and persists them to per-session and
//! cumulative CSV files, optionally mirroring each board's samples to a
//! Firebase Realtime Database. A presentation layer (the bundled CLI, or a
//! GUI) drives it through [`controller::CaptureController`].
//!
//! ## Crate Structure
//!
//! - **`board`**: Board families, status strings, the serial opener seam and
//!   the per-board reader task.
//! - **`config`**: Layered configuration (defaults, TOML, environment) via `figment`.
//! - **`controller`**: Session lifecycle: start, stop, auto-stop and snapshots.
//! - **`error`**: The `CaptureError` and `RemoteError` enums.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`parser`**: Line sanitizing, block markers, measurement and battery parsing.
//! - **`sample`**: `Sample`, `Measurement` and output column keys.
//! - **`session`**: Capture requests and the immutable session derived from them.
//! - **`storage`**: Output paths, CSV sinks, the remote mirror and the writer task.
//! - **`store`**: Latest-sample store and the status board shared by all tasks.
//! - **`sync`**: Header construction and row synchronization.
//!
//! ## Data Flow
//!
//! ```text
//! serial port -> reader -> SampleStore -> writer -> CSV (session + cumulative)
//!                   |                        \-> remote mirror
//!                   \-> StatusBoard <- controller.snapshot()
//! ```

pub mod board;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod parser;
pub mod sample;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;

pub use controller::{CaptureController, CaptureSnapshot};
pub use error::{AppResult, CaptureError, RemoteError};
pub use session::{CaptureRequest, Stage};
