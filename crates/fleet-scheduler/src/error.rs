//! Error types for the scheduler crate.
//!
//! Only registration and lifecycle errors are returned to callers. Failures
//! inside a firing are captured in its `Execution` and reported through the
//! monitor, never propagated.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while building a schedule. They surface at registration
/// time and never while the scheduler runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleParseError {
    /// Cron expression rejected by the parser
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Cron expression with the wrong number of fields
    #[error("Invalid cron expression '{expr}': expected 5 or 6 fields, found {found}")]
    FieldCount { expr: String, found: usize },

    /// Cron expression that never matches (e.g. 31 February)
    #[error("Cron expression '{0}' has no upcoming fire time")]
    NoUpcomingFire(String),

    /// Interval or delay of zero
    #[error("Schedule duration must be greater than zero")]
    ZeroDuration,

    /// One-shot instant that is not in the future
    #[error("One-shot fire time {0} is not in the future")]
    OneShotInPast(DateTime<Utc>),
}

/// Errors that can occur during scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Schedule rejected at registration
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleParseError),

    /// A job with this name is already registered
    #[error("Job already registered: {0}")]
    DuplicateJob(String),

    /// Job definition failed validation
    #[error("Invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    /// Job not found in registry
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Invalid timezone string
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Scheduler is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Scheduler is not running")]
    NotRunning,

    /// Scheduler has been shut down and cannot accept new work
    #[error("Scheduler has been shut down")]
    ShutDown,
}
