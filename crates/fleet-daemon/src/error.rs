//! Error types for the daemon's configuration layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `[[jobs]]` entry is inconsistent
    #[error("Job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    /// Scheduler rejected a definition
    #[error(transparent)]
    Scheduler(#[from] fleet_scheduler::SchedulerError),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
