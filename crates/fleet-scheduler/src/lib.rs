//! Background job scheduler for horizontally replicated services.
//!
//! Fires jobs on cron schedules, fixed intervals or one-shot instants,
//! keeps replicas from running the same job at once through leases in a
//! shared compare-and-set store, bounds local concurrency per job, and
//! retries failures with exponential backoff.
//!
//! # Features
//!
//! - Cron (5 or 6 fields, timezone aware), fixed-interval and one-shot schedules
//! - Fleet-wide exclusion via `fleet_lock::DistributedLock` leases, renewed while a handler runs
//! - Per-job concurrency limit with skip or bounded-queue overlap policy
//! - Retry with capped exponential backoff; handlers classify their own errors
//! - Timeouts with cooperative cancellation, then abort
//! - Monitoring events on a bounded broadcast channel that never blocks jobs
//! - Jitter to spread replicas that wake at the same instant
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fleet_lock::MemoryLockStore;
//! use fleet_scheduler::{
//!     handler_fn, JobDefinition, RetryPolicy, ScheduleSpec, SchedulerConfig, SchedulerService,
//! };
//!
//! let scheduler = SchedulerService::new(SchedulerConfig::default(), Arc::new(MemoryLockStore::new()))?;
//!
//! scheduler.register(
//!     JobDefinition::builder(
//!         "cleanup",
//!         ScheduleSpec::every(Duration::from_secs(30))?,
//!         handler_fn(|ctx| async move {
//!             purge_stale_sessions(ctx.cancellation_token()).await
//!         }),
//!     )
//!     .retry(RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5))
//!     .timeout(Duration::from_secs(20))
//!     .build()?,
//! )?;
//!
//! let mut events = scheduler.subscribe();
//! scheduler.start().await?;
//! ```

mod config;
mod error;
mod execution;
mod handler;
mod jitter;
mod job;
mod limiter;
mod monitor;
mod registry;
mod retry;
mod schedule;
mod scheduler;

pub use config::SchedulerConfig;
pub use error::{ScheduleParseError, SchedulerError};
pub use execution::{Execution, Outcome, SkipReason, Trigger};
pub use handler::{handler_fn, FnHandler, HandlerError, JobContext, JobHandler};
pub use jitter::JitterConfig;
pub use job::{JobDefinition, JobDefinitionBuilder, DEFAULT_LOCK_TTL};
pub use limiter::{ConcurrencyLimiter, OverlapPolicy, Permit, SlotDenied};
pub use monitor::{EventKind, Monitor, MonitorEvent};
pub use registry::{DueJob, JobRegistry, JobStatus};
pub use retry::{RetryDecision, RetryPolicy};
pub use schedule::{CronSchedule, ScheduleSpec};
pub use scheduler::SchedulerService;
