//! Error types for the catalog and event log.

use thiserror::Error;

/// Errors that can occur when resolving workloads or writing the event log.
#[derive(Debug, Error)]
pub enum EventError {
    /// The name is not part of the benchmark catalog.
    #[error("unknown benchmark: {0}")]
    UnknownBenchmark(String),

    /// The event log could not be opened or written.
    #[error("event log I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
