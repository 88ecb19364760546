//! Durable output: CSV files and the optional remote mirror.
//!
//! - [`paths`]: folder layout, run numbering and pending-file names
//! - [`csv_sink`]: append-only CSV target with permission fallback
//! - [`remote`]: remote key-value mirror with sequence numbers and error budget
//! - [`writer`]: the per-family writer task tying them together

pub mod csv_sink;
pub mod paths;
pub mod remote;
pub mod writer;

pub use csv_sink::CsvSink;
pub use paths::FamilyPaths;
pub use remote::{RemoteCapability, RemoteMirror, RemoteStore};
pub use writer::{run_writer, WriterConfig};
