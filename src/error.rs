use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use crate::config::ConfigError;
use crate::metrics::ResultFileError;

/// Why a single trial did not produce a result.
///
/// Every variant is local to one trial: the runner records it as a failed
/// entry and moves on to the next strategy.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("cannot prepare {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start {role} process {program:?}: {source}")]
    Spawn {
        role: &'static str,
        program: String,
        source: std::io::Error,
    },

    #[error("server did not become healthy within {timeout:?}; see {}", server_log.display())]
    HealthTimeout {
        timeout: Duration,
        server_log: PathBuf,
    },

    #[error("server exited before becoming healthy ({status}); see {}", server_log.display())]
    ServerExited {
        status: ExitStatus,
        server_log: PathBuf,
    },

    #[error("client exited with {status}; see {}", client_log.display())]
    ClientFailed {
        status: ExitStatus,
        client_log: PathBuf,
    },

    #[error("client produced no usable result at {}: {source}", path.display())]
    MissingResult {
        path: PathBuf,
        #[source]
        source: ResultFileError,
    },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        source: std::io::Error,
    },

    #[error("trial cancelled")]
    Cancelled,
}

impl TrialError {
    /// Stable identifier written into reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TrialError::Configuration(_) => "configuration",
            TrialError::Prepare { .. } => "prepare",
            TrialError::Spawn { .. } => "spawn",
            TrialError::HealthTimeout { .. } => "health_timeout",
            TrialError::ServerExited { .. } => "server_exited",
            TrialError::ClientFailed { .. } => "client_failed",
            TrialError::MissingResult { .. } => "missing_result",
            TrialError::Io { .. } => "io",
            TrialError::Cancelled => "cancelled",
        }
    }

    /// The log most useful for diagnosing this failure, if any.
    pub fn diagnostic_log(&self) -> Option<&Path> {
        match self {
            TrialError::HealthTimeout { server_log, .. }
            | TrialError::ServerExited { server_log, .. } => Some(server_log),
            TrialError::ClientFailed { client_log, .. } => Some(client_log),
            TrialError::MissingResult { path, .. } => Some(path),
            _ => None,
        }
    }
}
