//! Error taxonomy for the control plane.
//!
//! Every state-machine operation returns one of these; the adapters map them
//! onto their own protocols (HTTP status + JSON body, process exit codes).
//! Alerting transport failures deliberately have no variant here: the
//! notifier swallows them so control-plane correctness never depends on
//! telemetry delivery.

use thiserror::Error;

/// Failures surfaced by registry and state-machine operations.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no instance {0}")]
    UnknownInstance(String),

    #[error("instance {0} is already running")]
    AlreadyRunning(String),

    #[error("instance {0} is not running")]
    NotRunning(String),

    #[error("instance {id} has invalid config: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("bundle parse error at line {line}: {reason}")]
    ImportParse { line: usize, reason: String },

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("worker call failed: {0}")]
    Worker(String),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl ControlError {
    /// Flatten a worker-side failure chain into a `Worker` variant.
    pub fn worker(err: anyhow::Error) -> Self {
        ControlError::Worker(format!("{err:#}"))
    }
}
