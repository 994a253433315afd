//! Scheduler service: the dispatch loop and the life of each firing.
//!
//! The loop only decides *when* jobs run. Every due job is handed to its own
//! task, which takes a local slot, then the job's lease, runs the handler
//! under a timeout while renewing the lease, releases both, and retries with
//! backoff when the handler asks for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fleet_lock::{deadline_after, DistributedLock, LockLease, LockStore};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    ConcurrencyLimiter, CronSchedule, DueJob, Execution, HandlerError, JobContext,
    JobDefinition, JobRegistry, Monitor, MonitorEvent, Outcome, RetryDecision, ScheduleSpec,
    SchedulerConfig, SchedulerError, SkipReason, Trigger,
};

/// Scheduler handle.
///
/// Cheap to clone; every clone drives the same scheduler, so handlers may
/// hold one to register or remove jobs while they run.
#[derive(Clone)]
pub struct SchedulerService {
    inner: Arc<SchedulerInner>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    timezone: Tz,
    registry: JobRegistry,
    limiter: ConcurrencyLimiter,
    lock: DistributedLock,
    monitor: Monitor,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
    is_running: AtomicBool,
}

/// How the wait on a running handler ended.
enum HandlerStop {
    Joined(Result<Result<(), HandlerError>, JoinError>),
    TimedOut,
    ShuttingDown,
}

impl SchedulerService {
    /// Create a scheduler coordinating through `store`.
    ///
    /// The scheduler is created but not started. Call `start()` to begin
    /// dispatching scheduled jobs; `trigger_now` works either way.
    ///
    /// # Errors
    ///
    /// `InvalidTimezone` if `config.default_timezone` is not an IANA name.
    pub fn new(config: SchedulerConfig, store: Arc<dyn LockStore>) -> Result<Self, SchedulerError> {
        let timezone = config.parse_timezone()?;
        let lock = DistributedLock::new(store, config.instance_id.clone());
        let monitor = Monitor::new(config.monitor_capacity);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                timezone,
                registry: JobRegistry::new(),
                limiter: ConcurrencyLimiter::new(),
                lock,
                monitor,
                shutdown_token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                is_running: AtomicBool::new(false),
                config,
            }),
            loop_handle: Arc::new(Mutex::new(None)),
        })
    }

    /// Cron schedule in the configured default timezone.
    pub fn cron_schedule(&self, expr: &str) -> Result<ScheduleSpec, SchedulerError> {
        Ok(ScheduleSpec::Cron(CronSchedule::parse(
            expr,
            self.inner.timezone,
        )?))
    }

    /// Register a job.
    ///
    /// # Errors
    ///
    /// `DuplicateJob` if the name is taken (use [`replace`](Self::replace)
    /// to swap a definition), `InvalidJob` / `InvalidSchedule` if the
    /// definition can never run.
    pub fn register(&self, definition: JobDefinition) -> Result<(), SchedulerError> {
        let definition = self.inner.registry.register(definition)?;
        self.inner
            .limiter
            .configure(&definition.name, definition.max_concurrency);
        Ok(())
    }

    /// Register `definition`, replacing a job of the same name if present.
    pub fn replace(&self, definition: JobDefinition) -> Result<bool, SchedulerError> {
        let name = definition.name.clone();
        let max_concurrency = definition.max_concurrency;
        let replaced = self.inner.registry.replace(definition)?;
        self.inner.limiter.configure(&name, max_concurrency);
        Ok(replaced)
    }

    /// Remove a job. Idempotent: `false` if it was not registered.
    pub fn unregister(&self, job_name: &str) -> bool {
        let removed = self.inner.registry.unregister(job_name);
        if removed {
            self.inner.limiter.remove(job_name);
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<JobDefinition>> {
        self.inner.registry.list()
    }

    /// Stop dispatching `job_name` on schedule. Manual triggers still run.
    pub fn pause_job(&self, job_name: &str) -> Result<(), SchedulerError> {
        if !self.inner.registry.set_paused(job_name, true) {
            return Err(SchedulerError::JobNotFound(job_name.to_string()));
        }
        info!(job = %job_name, "Job paused");
        Ok(())
    }

    pub fn resume_job(&self, job_name: &str) -> Result<(), SchedulerError> {
        if !self.inner.registry.set_paused(job_name, false) {
            return Err(SchedulerError::JobNotFound(job_name.to_string()));
        }
        info!(job = %job_name, "Job resumed");
        Ok(())
    }

    /// Fire `job_name` now, outside its schedule.
    ///
    /// The firing still goes through the lease and the concurrency limit.
    /// The handle resolves to the firing's last execution once retries are
    /// exhausted.
    pub fn trigger_now(&self, job_name: &str) -> Result<JoinHandle<Execution>, SchedulerError> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let definition = self
            .inner
            .registry
            .get(job_name)
            .ok_or_else(|| SchedulerError::JobNotFound(job_name.to_string()))?;

        info!(job = %job_name, "Manual trigger");
        let inner = self.inner.clone();
        Ok(self
            .inner
            .tracker
            .spawn(inner.run_firing(definition, Utc::now(), Trigger::Manual)))
    }

    /// Start the dispatch loop.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if started twice, `ShutDown` after `shutdown()`.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let handle = tokio::spawn(self.inner.clone().run_loop());
        *self.loop_handle.lock() = Some(handle);
        info!(
            instance = %self.inner.config.instance_id,
            jobs = self.inner.registry.job_count(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Shut down: stop dispatching, cancel in-flight handlers and wait up
    /// to `shutdown_timeout_secs` for their firings to end.
    ///
    /// Returns once the wait ends either way. Leases of firings still
    /// running afterwards expire on their own.
    ///
    /// Also applies to a scheduler that was never started: firings begun
    /// through `trigger_now` are cancelled and awaited the same way.
    ///
    /// # Errors
    ///
    /// `NotRunning` if shutdown already happened.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");
        self.inner.shutdown_token.cancel();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        self.inner.tracker.close();
        let timeout = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.tracker.len(),
                timeout_secs = timeout.as_secs(),
                "Shutdown timeout elapsed with firings still running"
            );
        }

        self.inner.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");
        Ok(())
    }

    /// Token cancelled when shutdown begins. Every handler's context token
    /// is a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown_token.clone()
    }

    /// Check if the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Concurrency slots held across all jobs in this process.
    pub fn in_flight(&self) -> usize {
        self.inner.limiter.total_in_flight()
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.monitor.subscribe()
    }

    /// Get the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

impl SchedulerInner {
    async fn run_loop(self: Arc<Self>) {
        let max_idle = self.config.max_idle();

        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            for due in self.registry.due_jobs(Utc::now()) {
                self.dispatch(due);
            }

            let sleep_for = self
                .registry
                .next_wakeup()
                .map(|next| (next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(max_idle)
                .min(max_idle);

            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = self.registry.changed() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        debug!("Scheduler loop stopped");
    }

    fn dispatch(self: &Arc<Self>, due: DueJob) {
        debug!(job = %due.definition.name, scheduled_at = %due.scheduled_at, "Dispatching job");
        let inner = self.clone();
        self.tracker.spawn(async move {
            inner
                .run_firing(due.definition, due.scheduled_at, Trigger::Schedule)
                .await;
        });
    }

    /// One firing: attempts until success, a non-retryable error, the
    /// attempt budget or shutdown. Returns the last execution.
    async fn run_firing(
        self: Arc<Self>,
        definition: Arc<JobDefinition>,
        scheduled_at: DateTime<Utc>,
        trigger: Trigger,
    ) -> Execution {
        let mut attempt = 1;

        let execution = loop {
            let (execution, error) = self
                .run_attempt(&definition, scheduled_at, attempt, trigger)
                .await;
            let outcome = execution
                .outcome
                .clone()
                .unwrap_or(Outcome::Skipped(SkipReason::ShuttingDown));
            self.registry
                .record_complete(&definition.name, &outcome, execution.duration_ms());

            let decision = match &error {
                Some(error) if !self.shutdown_token.is_cancelled() => {
                    definition.retry.should_retry(attempt, error)
                }
                _ => RetryDecision::GiveUp,
            };

            match decision {
                RetryDecision::GiveUp => {
                    let (execution, outcome) = finalize(execution, outcome);
                    self.monitor
                        .emit(MonitorEvent::finished(&execution, outcome, true));
                    break execution;
                }
                RetryDecision::RetryAfter(delay) => {
                    self.monitor
                        .emit(MonitorEvent::finished(&execution, outcome.clone(), false));
                    self.monitor.emit(MonitorEvent::retry_scheduled(
                        &execution,
                        delay.as_millis() as u64,
                    ));

                    tokio::select! {
                        _ = self.shutdown_token.cancelled() => {
                            info!(job = %definition.name, attempt, "Retry abandoned at shutdown");
                            // The last attempt's result becomes the terminal one
                            self.monitor
                                .emit(MonitorEvent::finished(&execution, outcome, true));
                            break execution;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        };

        if trigger == Trigger::Schedule
            && definition.schedule.is_one_shot()
            && self.registry.remove_if_same(&definition)
        {
            self.limiter.remove(&definition.name);
            debug!(job = %definition.name, "One-shot job retired");
        }

        execution
    }

    /// A single attempt. Returns the finished execution and, when the
    /// handler failed, the error the retry policy should judge.
    async fn run_attempt(
        &self,
        definition: &JobDefinition,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        trigger: Trigger,
    ) -> (Execution, Option<HandlerError>) {
        let mut execution = Execution::begin(&definition.name, scheduled_at, attempt, trigger);

        if attempt == 1 && trigger == Trigger::Schedule && definition.jitter.is_enabled() {
            let delay = definition.jitter.sample();
            debug!(job = %definition.name, jitter_ms = delay.as_millis() as u64, "Applying jitter");
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    return skipped(execution, SkipReason::ShuttingDown);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if self.shutdown_token.is_cancelled() {
            return skipped(execution, SkipReason::ShuttingDown);
        }

        // Local slot first: a queued firing must not sit on a fleet lease
        let permit = match self
            .limiter
            .acquire(
                &definition.name,
                definition.max_concurrency,
                definition.overlap,
                &self.shutdown_token,
            )
            .await
        {
            Ok(permit) => permit,
            Err(denied) => return skipped(execution, denied.into()),
        };

        let mut lease = if definition.distributed {
            let keys = definition.lease_keys(&self.config.key_prefix);
            match self.lock.acquire_any(&keys, definition.lock_ttl).await {
                Ok(Some(lease)) => Some(lease),
                Ok(None) => {
                    permit.release();
                    return skipped(execution, SkipReason::LockHeldElsewhere);
                }
                Err(e) => {
                    permit.release();
                    warn!(job = %definition.name, error = %e, "Lock store unavailable, skipping firing");
                    return skipped(execution, SkipReason::LockStoreUnavailable);
                }
            }
        } else {
            None
        };

        execution.mark_running();
        self.registry.record_start(&definition.name);
        self.monitor.emit(MonitorEvent::started(&execution));

        let (outcome, error) = self
            .run_handler(definition, &execution, lease.as_mut())
            .await;

        if let Some(lease) = lease {
            self.lock.release(lease).await;
        }
        permit.release();

        execution.finish(outcome);
        (execution, error)
    }

    /// Run the handler on its own task, renewing `lease` every third of the
    /// TTL, until it returns, times out or shutdown cuts it off.
    async fn run_handler(
        &self,
        definition: &JobDefinition,
        execution: &Execution,
        mut lease: Option<&mut LockLease>,
    ) -> (Outcome, Option<HandlerError>) {
        let cancel = self.shutdown_token.child_token();
        let ctx = JobContext::new(
            &definition.name,
            execution.id,
            execution.attempt,
            execution.scheduled_at,
            execution.trigger,
            cancel.clone(),
        );
        let handler = definition.handler.clone();
        let mut task = tokio::spawn(async move { handler.execute(ctx).await });

        let deadline = definition
            .timeout
            .map(|timeout| deadline_after(Instant::now(), timeout));
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let period = (definition.lock_ttl / 3).max(Duration::from_millis(1));
        let mut renewal = tokio::time::interval_at(deadline_after(Instant::now(), period), period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop = loop {
            tokio::select! {
                joined = &mut task => break HandlerStop::Joined(joined),
                _ = &mut timeout => break HandlerStop::TimedOut,
                _ = self.shutdown_token.cancelled() => break HandlerStop::ShuttingDown,
                _ = renewal.tick(), if lease.is_some() => {
                    if let Some(held) = lease.as_deref_mut() {
                        if !self.lock.renew(held, definition.lock_ttl).await {
                            warn!(job = %definition.name, attempt = execution.attempt, "Lease renewal failed, handler keeps running");
                        }
                    }
                }
            }
        };

        let grace = self.config.cancel_grace();
        match stop {
            HandlerStop::Joined(joined) => handler_result(joined),
            HandlerStop::TimedOut => {
                cancel.cancel();
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    warn!(job = %definition.name, grace_ms = grace.as_millis() as u64, "Handler ignored cancellation after timeout, aborting");
                    task.abort();
                }
                (
                    Outcome::TimedOut,
                    Some(HandlerError::retryable("handler timed out")),
                )
            }
            HandlerStop::ShuttingDown => match tokio::time::timeout(grace, &mut task).await {
                Ok(joined) => handler_result(joined),
                Err(_) => {
                    warn!(job = %definition.name, "Handler ignored shutdown, aborting");
                    task.abort();
                    let message = "aborted at shutdown";
                    (
                        Outcome::Failure(message.to_string()),
                        Some(HandlerError::fatal(message)),
                    )
                }
            },
        }
    }
}

/// A firing that gives up on a timed-out attempt ends as a failure.
fn finalize(mut execution: Execution, outcome: Outcome) -> (Execution, Outcome) {
    if outcome != Outcome::TimedOut {
        return (execution, outcome);
    }
    let failed = Outcome::Failure(format!(
        "handler timed out on final attempt {}",
        execution.attempt
    ));
    execution.outcome = Some(failed.clone());
    (execution, failed)
}

fn skipped(mut execution: Execution, reason: SkipReason) -> (Execution, Option<HandlerError>) {
    execution.finish(Outcome::Skipped(reason));
    (execution, None)
}

fn handler_result(
    joined: Result<Result<(), HandlerError>, JoinError>,
) -> (Outcome, Option<HandlerError>) {
    match joined {
        Ok(Ok(())) => (Outcome::Success, None),
        Ok(Err(error)) => (Outcome::Failure(error.to_string()), Some(error)),
        Err(e) => {
            let message = if e.is_panic() {
                "handler panicked"
            } else {
                "handler task cancelled"
            };
            (
                Outcome::Failure(message.to_string()),
                Some(HandlerError::fatal(message)),
            )
        }
    }
}
