//! Job registry: definitions, cached next fire times and execution status.
//!
//! The `JobRegistry` owns every registered `JobDefinition` (shared out as
//! `Arc`) together with the next instant it is due and a running tally of
//! its executions. All state sits behind one mutex with short critical
//! sections; nothing awaits or calls user code while holding it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::{JobDefinition, Outcome, SchedulerError};

/// Status of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatus {
    /// Name of the job
    pub job_name: String,
    /// Human-readable schedule
    pub schedule: String,
    /// When the job last started a handler (if ever)
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the last finished attempt in milliseconds
    pub last_duration_ms: Option<u64>,
    /// Outcome of the last finished attempt, skips included
    pub last_result: Option<Outcome>,
    /// When the job is next due
    pub next_run: Option<DateTime<Utc>>,
    /// Attempts that ran the handler
    pub run_count: u64,
    /// Attempts that failed or timed out
    pub error_count: u64,
    /// Handlers of this job running in this process right now
    pub running: u32,
    /// Whether the job is paused
    pub is_paused: bool,
}

impl JobStatus {
    fn new(definition: &JobDefinition, next_run: Option<DateTime<Utc>>) -> Self {
        Self {
            job_name: definition.name.clone(),
            schedule: definition.schedule.to_string(),
            last_run: None,
            last_duration_ms: None,
            last_result: None,
            next_run,
            run_count: 0,
            error_count: 0,
            running: 0,
            is_paused: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }
}

/// A job whose fire time has come.
#[derive(Debug, Clone)]
pub struct DueJob {
    pub definition: Arc<JobDefinition>,
    /// The tick being fired
    pub scheduled_at: DateTime<Utc>,
}

struct JobEntry {
    definition: Arc<JobDefinition>,
    next_fire: Option<DateTime<Utc>>,
    status: JobStatus,
}

/// Registry of scheduled jobs.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fleet_scheduler::{handler_fn, JobContext, JobDefinition, JobRegistry, Outcome, ScheduleSpec};
///
/// let registry = JobRegistry::new();
/// let job = JobDefinition::builder(
///     "hourly-rollup",
///     ScheduleSpec::cron("0 * * * *").unwrap(),
///     handler_fn(|_ctx: JobContext| async { Ok(()) }),
/// )
/// .build()
/// .unwrap();
/// registry.register(job).unwrap();
///
/// // Job starts
/// registry.record_start("hourly-rollup");
/// assert!(registry.is_running("hourly-rollup"));
///
/// // Job completes
/// registry.record_complete("hourly-rollup", &Outcome::Success, 1500);
/// assert!(!registry.is_running("hourly-rollup"));
/// ```
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    changed: Notify,
}

impl JobRegistry {
    /// Create a new empty job registry.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Register a new job.
    ///
    /// # Errors
    ///
    /// `DuplicateJob` if the name is taken, `InvalidJob` or `InvalidSchedule`
    /// if the definition can never run.
    pub fn register(&self, definition: JobDefinition) -> Result<Arc<JobDefinition>, SchedulerError> {
        self.register_at(definition, Utc::now())
    }

    /// Register as if the current time were `now`.
    pub fn register_at(
        &self,
        definition: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<Arc<JobDefinition>, SchedulerError> {
        definition.validate()?;
        let next_fire = definition.schedule.first_fire_time(now)?;

        let definition = Arc::new(definition);
        {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&definition.name) {
                return Err(SchedulerError::DuplicateJob(definition.name.clone()));
            }
            jobs.insert(
                definition.name.clone(),
                JobEntry {
                    status: JobStatus::new(&definition, Some(next_fire)),
                    definition: definition.clone(),
                    next_fire: Some(next_fire),
                },
            );
        }

        tracing::info!(job = %definition.name, schedule = %definition.schedule, next_run = %next_fire, "Registered job");
        self.changed.notify_one();
        Ok(definition)
    }

    /// Register `definition`, replacing any job of the same name.
    ///
    /// Counters and the paused flag of a replaced job carry over; its next
    /// fire time is recomputed from the new schedule. Returns whether a job
    /// was replaced.
    pub fn replace(&self, definition: JobDefinition) -> Result<bool, SchedulerError> {
        self.replace_at(definition, Utc::now())
    }

    pub fn replace_at(&self, definition: JobDefinition, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        definition.validate()?;
        let next_fire = definition.schedule.first_fire_time(now)?;

        let definition = Arc::new(definition);
        let replaced = {
            let mut jobs = self.jobs.lock();
            let mut status = JobStatus::new(&definition, Some(next_fire));
            let previous = jobs.remove(&definition.name);
            if let Some(previous) = &previous {
                let old = &previous.status;
                status.last_run = old.last_run;
                status.last_duration_ms = old.last_duration_ms;
                status.last_result = old.last_result.clone();
                status.run_count = old.run_count;
                status.error_count = old.error_count;
                status.running = old.running;
                status.is_paused = old.is_paused;
            }
            jobs.insert(
                definition.name.clone(),
                JobEntry {
                    definition: definition.clone(),
                    next_fire: Some(next_fire),
                    status,
                },
            );
            previous.is_some()
        };

        tracing::info!(job = %definition.name, replaced, "Replaced job definition");
        self.changed.notify_one();
        Ok(replaced)
    }

    /// Remove a job. Returns `false` (and does nothing) if it is not registered.
    ///
    /// Firings already under way finish normally.
    pub fn unregister(&self, job_name: &str) -> bool {
        let removed = self.jobs.lock().remove(job_name).is_some();
        if removed {
            tracing::info!(job = %job_name, "Unregistered job");
            self.changed.notify_one();
        }
        removed
    }

    /// Remove `job_name` only if it is still the given definition.
    ///
    /// Used to retire a one-shot after its firing without clobbering a
    /// definition registered under the same name in the meantime.
    pub fn remove_if_same(&self, definition: &Arc<JobDefinition>) -> bool {
        let mut jobs = self.jobs.lock();
        let same = jobs
            .get(&definition.name)
            .is_some_and(|entry| Arc::ptr_eq(&entry.definition, definition));
        if same {
            jobs.remove(&definition.name);
        }
        same
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.lock().get(job_name).map(|e| e.definition.clone())
    }

    /// All definitions, sorted by name.
    pub fn list(&self) -> Vec<Arc<JobDefinition>> {
        let mut defs: Vec<_> = self
            .jobs
            .lock()
            .values()
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Jobs due at `now`, each advanced to its following fire time.
    ///
    /// Paused recurring jobs are advanced without being returned, so they do
    /// not fire a backlog on resume. A paused one-shot stays due until it is
    /// resumed.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut due = Vec::new();
        let mut jobs = self.jobs.lock();

        for entry in jobs.values_mut() {
            let Some(scheduled_at) = entry.next_fire else {
                continue;
            };
            if scheduled_at > now {
                continue;
            }
            if entry.status.is_paused && entry.definition.schedule.is_one_shot() {
                continue;
            }

            let next = entry.definition.schedule.next_after_tick(scheduled_at, now);
            entry.next_fire = next;
            entry.status.next_run = next;

            if !entry.status.is_paused {
                due.push(DueJob {
                    definition: entry.definition.clone(),
                    scheduled_at,
                });
            }
        }

        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due
    }

    /// Earliest pending fire time among jobs that are not paused.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .lock()
            .values()
            .filter(|e| !e.status.is_paused)
            .filter_map(|e| e.next_fire)
            .min()
    }

    pub fn next_fire_time(&self, job_name: &str) -> Option<DateTime<Utc>> {
        self.jobs.lock().get(job_name).and_then(|e| e.next_fire)
    }

    /// Resolves after the next registration change (or immediately if one
    /// happened since the last wait).
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Record that a handler of the job started.
    pub fn record_start(&self, job_name: &str) {
        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get_mut(job_name) {
            entry.status.running += 1;
            entry.status.last_run = Some(Utc::now());
        }
    }

    /// Record a finished attempt.
    ///
    /// Skipped attempts never started a handler: they only update
    /// `last_result`.
    pub fn record_complete(&self, job_name: &str, outcome: &Outcome, duration_ms: u64) {
        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get_mut(job_name) {
            let status = &mut entry.status;
            if !outcome.is_skipped() {
                status.running = status.running.saturating_sub(1);
                status.last_duration_ms = Some(duration_ms);
                status.run_count += 1;
                if outcome.is_error() {
                    status.error_count += 1;
                }
            }
            status.last_result = Some(outcome.clone());
        }
    }

    /// Set the paused state of a job. Returns `false` for unknown jobs.
    pub fn set_paused(&self, job_name: &str, paused: bool) -> bool {
        let found = {
            let mut jobs = self.jobs.lock();
            match jobs.get_mut(job_name) {
                Some(entry) => {
                    entry.status.is_paused = paused;
                    true
                }
                None => false,
            }
        };
        if found {
            self.changed.notify_one();
        }
        found
    }

    /// Get the status of a specific job.
    ///
    /// Returns `None` if the job is not registered.
    pub fn get_status(&self, job_name: &str) -> Option<JobStatus> {
        self.jobs.lock().get(job_name).map(|e| e.status.clone())
    }

    /// Get the status of all registered jobs, sorted by name.
    pub fn get_all_status(&self) -> Vec<JobStatus> {
        let mut all: Vec<_> = self.jobs.lock().values().map(|e| e.status.clone()).collect();
        all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        all
    }

    /// Check if a handler of the job is running in this process.
    ///
    /// Returns `false` if the job is not registered.
    pub fn is_running(&self, job_name: &str) -> bool {
        self.jobs
            .lock()
            .get(job_name)
            .map(|e| e.status.is_running())
            .unwrap_or(false)
    }

    /// Check if a job is registered.
    pub fn is_registered(&self, job_name: &str) -> bool {
        self.jobs.lock().contains_key(job_name)
    }

    /// Check if a job is paused.
    ///
    /// Returns `false` if the job is not registered.
    pub fn is_paused(&self, job_name: &str) -> bool {
        self.jobs
            .lock()
            .get(job_name)
            .map(|e| e.status.is_paused)
            .unwrap_or(false)
    }

    /// Get the number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
