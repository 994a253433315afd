//! Execution records: one per firing attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Why a firing did not run its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another holder owns the job's lease
    LockHeldElsewhere,
    /// The lock store could not be reached; skipped rather than risk a duplicate
    LockStoreUnavailable,
    /// All local slots busy under the skip overlap policy
    ConcurrencyLimit,
    /// All local slots busy and the wait queue is at its bound
    QueueFull,
    /// Shutdown began before the handler started
    ShuttingDown,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LockHeldElsewhere => "lock held elsewhere",
            Self::LockStoreUnavailable => "lock store unavailable",
            Self::ConcurrencyLimit => "concurrency limit reached",
            Self::QueueFull => "queue full",
            Self::ShuttingDown => "scheduler shutting down",
        };
        f.write_str(text)
    }
}

/// Result of one firing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Handler returned `Ok`
    Success,
    /// Handler returned an error (or panicked)
    Failure(String),
    /// Handler exceeded the job's timeout
    TimedOut,
    /// Handler never ran
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failures and timeouts both count as errors.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_) | Self::TimedOut)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure(error) => write!(f, "failure: {}", error),
            Self::TimedOut => f.write_str("timed out"),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

/// What caused a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The job's schedule came due
    Schedule,
    /// `SchedulerService::trigger_now`
    Manual,
}

/// Record of one attempt to run a job.
///
/// Lives only for the duration of the firing; the monitor is the place to
/// archive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: Ulid,
    pub job_name: String,
    /// Tick this firing belongs to (dispatch time for manual triggers)
    pub scheduled_at: DateTime<Utc>,
    /// When the attempt was dequeued; reset when the handler starts
    pub started_at: DateTime<Utc>,
    /// `None` while the attempt is in progress
    pub finished_at: Option<DateTime<Utc>>,
    /// 1-based
    pub attempt: u32,
    pub trigger: Trigger,
    /// `None` while the attempt is in progress
    pub outcome: Option<Outcome>,
}

impl Execution {
    pub(crate) fn begin(
        job_name: &str,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: Trigger,
    ) -> Self {
        Self {
            id: Ulid::new(),
            job_name: job_name.to_string(),
            scheduled_at,
            started_at: Utc::now(),
            finished_at: None,
            attempt,
            trigger,
            outcome: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.started_at = Utc::now();
    }

    pub(crate) fn finish(&mut self, outcome: Outcome) {
        self.finished_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Wall time from start to finish, or to now while running.
    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::LockHeldElsewhere.to_string(),
            "lock held elsewhere"
        );
        assert_eq!(
            Outcome::Skipped(SkipReason::QueueFull).to_string(),
            "skipped: queue full"
        );
        assert_eq!(
            Outcome::Failure("disk full".into()).to_string(),
            "failure: disk full"
        );
    }

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::Success.is_success());
        assert!(Outcome::TimedOut.is_error());
        assert!(Outcome::Failure("x".into()).is_error());
        assert!(!Outcome::Skipped(SkipReason::ConcurrencyLimit).is_error());
        assert!(Outcome::Skipped(SkipReason::ConcurrencyLimit).is_skipped());
    }

    #[test]
    fn test_execution_lifecycle() {
        let mut execution = Execution::begin("cleanup", Utc::now(), 1, Trigger::Schedule);
        assert!(!execution.is_finished());
        assert!(execution.outcome.is_none());

        execution.mark_running();
        execution.finish(Outcome::Success);

        assert!(execution.is_finished());
        assert_eq!(execution.outcome, Some(Outcome::Success));
        assert!(execution.finished_at.unwrap() >= execution.started_at);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&Outcome::Skipped(SkipReason::LockHeldElsewhere)).unwrap();
        assert_eq!(json, r#"{"Skipped":"lock_held_elsewhere"}"#);
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Outcome::Skipped(SkipReason::LockHeldElsewhere));
    }
}
