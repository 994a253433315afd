//! Retry policy with capped exponential backoff.

use std::time::Duration;

use crate::HandlerError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the job again after the delay
    RetryAfter(Duration),
    /// Finalize the firing as failed
    GiveUp,
}

/// Exponential backoff `base * 2^(attempt-1)`, capped at `max_delay`,
/// for at most `max_attempts` attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide whether attempt number `attempt` (1-based), which failed with
    /// `error`, gets another try.
    ///
    /// `max_attempts` counts every run, the first included, so a job runs at
    /// most `max_attempts` times and waits through `max_attempts - 1` delays.
    /// With the defaults (1s base, 5 attempts) that is 1s, 2s, 4s and 8s,
    /// then `GiveUp` after the fifth failure.
    pub fn should_retry(&self, attempt: u32, error: &HandlerError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempt))
    }
}
