//! Job definitions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    JitterConfig, JobHandler, OverlapPolicy, RetryPolicy, ScheduleSpec, SchedulerError,
};

/// Lease TTL used when a job does not set one.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// A registered unit of work: what runs, when, and under which limits.
///
/// The name is the job's identity across restarts and replicas; it is also
/// the basis of the job's lease key in the lock store.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub schedule: ScheduleSpec,
    pub handler: Arc<dyn JobHandler>,
    /// Simultaneous executions allowed across the fleet (and locally)
    pub max_concurrency: usize,
    pub overlap: OverlapPolicy,
    pub retry: RetryPolicy,
    /// Lease lifetime; renewed every third of it while the handler runs
    pub lock_ttl: Duration,
    pub timeout: Option<Duration>,
    pub jitter: JitterConfig,
    /// When false, only the local limiter gates the job
    pub distributed: bool,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("max_concurrency", &self.max_concurrency)
            .field("overlap", &self.overlap)
            .field("retry", &self.retry)
            .field("lock_ttl", &self.lock_ttl)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .field("distributed", &self.distributed)
            .finish_non_exhaustive()
    }
}

impl JobDefinition {
    pub fn builder(
        name: impl Into<String>,
        schedule: ScheduleSpec,
        handler: impl JobHandler + 'static,
    ) -> JobDefinitionBuilder {
        JobDefinitionBuilder::new(name.into(), schedule, Arc::new(handler))
    }

    /// Check the limits a definition must respect before registration.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |reason: &str| SchedulerError::InvalidJob {
            job: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be at least 1"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl must be greater than zero"));
        }
        if matches!(self.overlap, OverlapPolicy::Queue { max_depth: 0 }) {
            return Err(invalid("queue max_depth must be at least 1"));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(invalid("timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Lease keys a firing of this job may take, in the order it tries them.
    ///
    /// One key for single-instance jobs; `max_concurrency` numbered keys
    /// otherwise, so the bound holds across the whole fleet.
    pub fn lease_keys(&self, prefix: &str) -> Vec<String> {
        if self.max_concurrency <= 1 {
            return vec![format!("{}{}", prefix, self.name)];
        }
        (0..self.max_concurrency)
            .map(|slot| format!("{}{}#{}", prefix, self.name, slot))
            .collect()
    }
}

/// Builder for [`JobDefinition`].
pub struct JobDefinitionBuilder {
    definition: JobDefinition,
}

impl JobDefinitionBuilder {
    fn new(name: String, schedule: ScheduleSpec, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            definition: JobDefinition {
                name,
                schedule,
                handler,
                max_concurrency: 1,
                overlap: OverlapPolicy::default(),
                retry: RetryPolicy::default(),
                lock_ttl: DEFAULT_LOCK_TTL,
                timeout: None,
                jitter: JitterConfig::none(),
                distributed: true,
            },
        }
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.definition.max_concurrency = max_concurrency;
        self
    }

    pub fn overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.definition.overlap = overlap;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.definition.retry = retry;
        self
    }

    pub fn lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.definition.lock_ttl = lock_ttl;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    pub fn jitter(mut self, jitter: JitterConfig) -> Self {
        self.definition.jitter = jitter;
        self
    }

    /// Gate the job with the local limiter only.
    pub fn local_only(mut self) -> Self {
        self.definition.distributed = false;
        self
    }

    pub fn build(self) -> Result<JobDefinition, SchedulerError> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}
