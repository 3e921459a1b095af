//! Supervision errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker command is empty")]
    EmptyWorkerCommand,

    #[error("failed to create logfile directory {path}: {source}")]
    LogDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open logfile {path}: {source}")]
    Logfile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Worker launch failed. Retried on the next reconciliation pass; never
    /// fatal to the supervisor.
    #[error("failed to spawn worker for service {service}: {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },
}
