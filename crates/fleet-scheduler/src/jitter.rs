//! Random start delay for scheduled firings.
//!
//! Cron ticks land on the same wall-clock second on every replica. Sleeping a
//! random slice of `max` before taking the lease spreads the load on the
//! lock store.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on the random delay before a scheduled firing.
///
/// Manual triggers and retries never wait for jitter.
///
/// ```
/// use std::time::Duration;
/// use fleet_scheduler::JitterConfig;
///
/// let jitter = JitterConfig::from_secs(30);
/// assert!(jitter.sample() < Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JitterConfig {
    #[serde(with = "millis")]
    max: Duration,
}

impl JitterConfig {
    pub fn up_to(max: Duration) -> Self {
        Self { max }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::up_to(Duration::from_secs(secs))
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn is_enabled(&self) -> bool {
        !self.max.is_zero()
    }

    /// A delay in `[0, max)` at millisecond resolution; zero when disabled.
    pub fn sample(&self) -> Duration {
        let bound = self.max.as_millis().min(u64::MAX as u128) as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..bound))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
