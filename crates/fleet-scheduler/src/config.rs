//! Scheduler configuration.
//!
//! Provides configuration for the scheduler service including the
//! instance identity used in lease owner tokens, default timezone for
//! cron schedules, and shutdown/cancellation timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SchedulerError;

/// Configuration for the scheduler service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identity of this scheduler instance; prefixes every lease owner token.
    /// Defaults to a random `sched-<uuid>` so replicas never collide.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Default timezone for cron jobs (IANA timezone string, e.g., "America/New_York").
    /// Defaults to "UTC".
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Timeout in seconds for graceful shutdown.
    /// In-flight firings get this long to finish after cancellation is signalled.
    /// Defaults to 30 seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// How long a timed-out handler may take to honour cancellation before
    /// its task is aborted. Defaults to 5000 ms.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,

    /// Upper bound on a single loop sleep, so wall-clock jumps are noticed.
    /// Defaults to 60 seconds.
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// Buffered monitoring events per subscriber before the oldest are dropped.
    /// Defaults to 1024.
    #[serde(default = "default_monitor_capacity")]
    pub monitor_capacity: usize,

    /// Prefix for lease keys in the lock store. Defaults to "job:".
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_instance_id() -> String {
    format!("sched-{}", Uuid::new_v4().simple())
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_cancel_grace() -> u64 {
    5000
}

fn default_max_idle() -> u64 {
    60
}

fn default_monitor_capacity() -> usize {
    1024
}

fn default_key_prefix() -> String {
    "job:".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            default_timezone: default_timezone(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            cancel_grace_ms: default_cancel_grace(),
            max_idle_secs: default_max_idle(),
            monitor_capacity: default_monitor_capacity(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl SchedulerConfig {
    /// Parse the configured timezone string into a chrono_tz::Tz.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidTimezone` if the timezone string
    /// is not a valid IANA timezone identifier.
    pub fn parse_timezone(&self) -> Result<chrono_tz::Tz, SchedulerError> {
        self.default_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(self.default_timezone.clone()))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs.max(1))
    }
}
