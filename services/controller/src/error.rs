//! Controller error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// Errors that end a scheduling session.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The latency-critical service could not be located.
    #[error("service process {name:?} is not running (no PID found{hint})")]
    ServiceNotRunning { name: String, hint: String },

    /// The runtime event stream could not be re-established.
    #[error("runtime event stream lost: {0}")]
    EventStream(String),

    /// The event watcher task ended without being asked to.
    #[error("event watcher stopped unexpectedly: {0}")]
    WatcherStopped(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("session log error: {0}")]
    EventLog(#[from] coloc_events::EventError),
}

impl ControllerError {
    pub(crate) fn service_not_running(name: &str, pid_file: Option<&std::path::Path>) -> Self {
        let hint = match pid_file {
            Some(path) => format!(" via {}", path.display()),
            None => String::new(),
        };
        Self::ServiceNotRunning {
            name: name.to_string(),
            hint,
        }
    }
}
