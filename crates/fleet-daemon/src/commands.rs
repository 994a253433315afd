//! Command implementations for the fleet daemon.
//!
//! Handles:
//! - start: Load config, register jobs, run the scheduler until signalled
//! - stop: Signal running daemon to stop (via PID file)
//! - status: Check if daemon is running
//! - validate / next / config: offline inspection of schedules and settings

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleet_lock::{LockStore, MemoryLockStore};
use fleet_scheduler::{
    CronSchedule, EventKind, MonitorEvent, Outcome, ScheduleSpec, SchedulerService,
};

use crate::pidfile::{request_termination, DaemonState, PidFile};
use crate::Settings;

fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to install Ctrl+C handler")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Per-job tally of terminal outcomes seen on the monitoring channel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutcomeTally {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failure(_) | Outcome::TimedOut => self.failed += 1,
        }
    }
}

fn record_event(tally: &mut BTreeMap<String, OutcomeTally>, event: MonitorEvent) {
    if !event.terminal {
        return;
    }
    if let EventKind::Finished(outcome) = &event.kind {
        tally.entry(event.job_name).or_default().record(outcome);
    }
}

/// Follow the monitoring channel until `done` fires, counting each
/// firing's final outcome per job.
pub fn spawn_event_tally(
    scheduler: &SchedulerService,
    mut done: oneshot::Receiver<()>,
) -> JoinHandle<BTreeMap<String, OutcomeTally>> {
    let mut events = scheduler.subscribe();

    tokio::spawn(async move {
        let mut tally = BTreeMap::new();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => record_event(&mut tally, event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event tally fell behind, some outcomes not counted");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut done => {
                    while let Ok(event) = events.try_recv() {
                        record_event(&mut tally, event);
                    }
                    break;
                }
            }
        }
        tally
    })
}

/// Start the fleet daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Build job definitions and register them
/// 3. Start the scheduler
/// 4. Shut down gracefully on SIGINT/SIGTERM
pub async fn start_daemon(
    config_path: Option<&str>,
    foreground: bool,
    instance_id_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<()> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;

    // Apply CLI overrides (highest precedence)
    if let Some(instance_id) = instance_id_override {
        settings.scheduler.instance_id = instance_id.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }

    init_logging(&settings.log_level)?;

    info!("Fleet daemon starting...");
    info!("Configuration:");
    info!("  Instance id: {}", settings.scheduler.instance_id);
    info!("  Default timezone: {}", settings.scheduler.default_timezone);
    info!("  Jobs: {}", settings.jobs.len());
    info!("  Log level: {}", settings.log_level);

    if !foreground {
        warn!("Background mode is not supported, running in foreground");
        warn!("Use a process manager (systemd, launchd) for background operation");
    }

    let definitions = settings
        .job_definitions()
        .context("Invalid job configuration")?;

    // Leases live in process memory: jobs are exclusive within this daemon only
    let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
    let scheduler = SchedulerService::new(settings.scheduler.clone(), store)
        .context("Failed to create scheduler")?;

    for definition in definitions {
        let name = definition.name.clone();
        scheduler
            .register(definition)
            .with_context(|| format!("Failed to register job '{}'", name))?;
    }

    let (tally_done, tally_rx) = oneshot::channel();
    let tally = spawn_event_tally(&scheduler, tally_rx);

    let pid_file = PidFile::default_location();
    pid_file.claim().with_context(|| {
        format!("Failed to write PID file {}", pid_file.path().display())
    })?;

    scheduler.start().await.context("Failed to start scheduler")?;

    let signalled = shutdown_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        warn!("Error during scheduler shutdown: {}", e);
    }
    pid_file.remove();

    let _ = tally_done.send(());
    match tally.await {
        Ok(tally) => {
            for (job, counts) in tally {
                info!(
                    job = %job,
                    succeeded = counts.succeeded,
                    failed = counts.failed,
                    skipped = counts.skipped,
                    "Job summary"
                );
            }
        }
        Err(e) => warn!("Event tally task failed: {}", e),
    }

    signalled
}

/// Stop the running daemon by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid_file = PidFile::default_location();
    match pid_file.state() {
        DaemonState::Running(pid) => {
            info!(pid, "Stopping daemon");
            request_termination(pid)
                .with_context(|| format!("Failed to signal daemon (PID {})", pid))?;
            println!("Sent SIGTERM to daemon (PID {})", pid);
            Ok(())
        }
        DaemonState::Stale(pid) => {
            pid_file.remove();
            anyhow::bail!("Daemon not running (stale PID {} removed)", pid)
        }
        DaemonState::Absent => {
            anyhow::bail!(
                "No PID file at {} - daemon may not be running",
                pid_file.path().display()
            )
        }
    }
}

/// Show daemon status.
pub fn show_status() -> Result<()> {
    let pid_file = PidFile::default_location();
    match pid_file.state() {
        DaemonState::Running(pid) => {
            println!("Fleet daemon is running (PID {})", pid);
            println!("PID file: {}", pid_file.path().display());
        }
        DaemonState::Stale(pid) => println!(
            "Fleet daemon is NOT running (stale PID {} in {})",
            pid,
            pid_file.path().display()
        ),
        DaemonState::Absent => println!("Fleet daemon is NOT running (no PID file)"),
    }
    Ok(())
}

/// Up to `count` fire times of `schedule` after `from`.
pub fn upcoming_fire_times(
    schedule: &ScheduleSpec,
    from: DateTime<Utc>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut times = Vec::with_capacity(count);
    let mut cursor = from;
    while times.len() < count {
        match schedule.next_fire_time(cursor) {
            Some(next) => {
                times.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    times
}

/// Load settings, build every job and print its upcoming fire times.
pub fn validate_config(config_path: Option<&str>, count: usize) -> Result<()> {
    let settings = Settings::load(config_path).context("Failed to load configuration")?;
    let definitions = settings
        .job_definitions()
        .context("Invalid job configuration")?;

    if definitions.is_empty() {
        println!("Configuration is valid (no jobs defined)");
        return Ok(());
    }

    let now = Utc::now();
    for definition in &definitions {
        println!(
            "{}: {} (max_concurrency={}, lock_ttl={}s, distributed={})",
            definition.name,
            definition.schedule,
            definition.max_concurrency,
            definition.lock_ttl.as_secs(),
            definition.distributed
        );
        for time in upcoming_fire_times(&definition.schedule, now, count) {
            println!("  {}", time.to_rfc3339());
        }
    }
    println!("Configuration is valid ({} jobs)", definitions.len());
    Ok(())
}

/// Print the next `count` fire times of a cron expression.
pub fn show_next(
    config_path: Option<&str>,
    expression: &str,
    count: usize,
    timezone: Option<&str>,
) -> Result<()> {
    let tz: Tz = match timezone {
        Some(name) => name
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid timezone: {}", name))?,
        None => Settings::load(config_path)
            .context("Failed to load configuration")?
            .scheduler
            .parse_timezone()?,
    };

    let cron = CronSchedule::parse(expression, tz)?;
    for time in cron.upcoming(Utc::now(), count) {
        println!("{}", time.with_timezone(&tz).to_rfc3339());
    }
    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config_path: Option<&str>) -> Result<()> {
    let settings = Settings::load(config_path).context("Failed to load configuration")?;
    print!("{}", settings.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_status_reports_without_daemon() {
        assert!(show_status().is_ok());
    }

    #[test]
    fn test_upcoming_fire_times() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let every = ScheduleSpec::every(Duration::from_secs(90)).unwrap();
        let times = upcoming_fire_times(&every, from, 3);
        assert_eq!(
            times,
            vec![
                from + chrono::Duration::seconds(90),
                from + chrono::Duration::seconds(180),
                from + chrono::Duration::seconds(270),
            ]
        );

        let once = ScheduleSpec::at(from + chrono::Duration::hours(1));
        assert_eq!(upcoming_fire_times(&once, from, 5).len(), 1);

        let hourly = ScheduleSpec::cron("0 * * * *").unwrap();
        let times = upcoming_fire_times(&hourly, from, 2);
        assert_eq!(times[1] - times[0], chrono::Duration::hours(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_tally_counts_terminal_outcomes() {
        use fleet_scheduler::{handler_fn, HandlerError, JobContext, JobDefinition, RetryPolicy};

        let scheduler = SchedulerService::new(
            fleet_scheduler::SchedulerConfig::default(),
            Arc::new(MemoryLockStore::new()),
        )
        .unwrap();
        let hourly = || ScheduleSpec::cron("0 * * * *").unwrap();
        scheduler
            .register(
                JobDefinition::builder("ok", hourly(), handler_fn(|_ctx: JobContext| async { Ok(()) }))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        scheduler
            .register(
                JobDefinition::builder(
                    "broken",
                    hourly(),
                    handler_fn(|_ctx: JobContext| async { Err(HandlerError::retryable("down")) }),
                )
                .retry(RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(5), 2))
                .build()
                .unwrap(),
            )
            .unwrap();

        let (done, done_rx) = oneshot::channel();
        let tally = spawn_event_tally(&scheduler, done_rx);

        scheduler.trigger_now("ok").unwrap().await.unwrap();
        scheduler.trigger_now("ok").unwrap().await.unwrap();
        scheduler.trigger_now("broken").unwrap().await.unwrap();
        done.send(()).unwrap();

        let tally = tally.await.unwrap();
        assert_eq!(
            tally.get("ok"),
            Some(&OutcomeTally {
                succeeded: 2,
                failed: 0,
                skipped: 0
            })
        );
        // Two attempts, one terminal failure
        assert_eq!(tally.get("broken").map(|t| t.failed), Some(1));
    }

    #[test]
    fn test_show_next_rejects_bad_input() {
        assert!(show_next(None, "0 * * * *", 2, Some("Not/AZone")).is_err());
        assert!(show_next(None, "not cron", 2, Some("UTC")).is_err());
        assert!(show_next(None, "*/5 * * * *", 2, Some("Asia/Tokyo")).is_ok());
    }
}
