//! Layered daemon configuration.
//!
//! Sources, later overriding earlier:
//! 1. Built-in defaults
//! 2. Config file (~/.config/fleet-scheduler/config.toml)
//! 3. Config file given with `--config`
//! 4. Environment variables (`FLEET_*`, nested keys joined by `__`,
//!    e.g. `FLEET_SCHEDULER__SHUTDOWN_TIMEOUT_SECS`)
//!
//! CLI flags are applied by the caller after loading.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use fleet_scheduler::{
    JitterConfig, JobDefinition, OverlapPolicy, RetryPolicy, ScheduleSpec, SchedulerConfig,
    DEFAULT_LOCK_TTL,
};

use crate::{CommandHandler, DaemonError};

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// `[[jobs]]` tables
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scheduler: SchedulerConfig::default(),
            jobs: Vec::new(),
        }
    }
}

/// How a job reacts when all its slots are busy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapMode {
    #[default]
    Skip,
    Queue,
}

/// Retry settings of one job, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

/// One `[[jobs]]` entry: a command run on a schedule.
///
/// Exactly one of `cron`, `interval_secs`, `run_at` and `delay_secs` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSettings {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,

    /// Timezone for `cron` (defaults to the scheduler's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Supports `~` and `$VAR` expansion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Extra environment as `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub overlap: OverlapMode,
    /// Queue bound when `overlap = "queue"`
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default)]
    pub jitter_secs: u64,
    #[serde(default = "default_distributed")]
    pub distributed: bool,
    /// Exit codes that mean "do not retry"
    #[serde(default)]
    pub non_retryable_exit_codes: Vec<i32>,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_queue_depth() -> usize {
    1
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL.as_secs()
}

fn default_distributed() -> bool {
    true
}

impl JobSettings {
    fn invalid(&self, reason: impl Into<String>) -> DaemonError {
        DaemonError::InvalidJob {
            job: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// The job's schedule, with `default_tz` for cron entries without a timezone.
    pub fn schedule(&self, default_tz: Tz) -> Result<ScheduleSpec, DaemonError> {
        let sources = [
            self.cron.is_some(),
            self.interval_secs.is_some(),
            self.run_at.is_some(),
            self.delay_secs.is_some(),
        ];
        match sources.iter().filter(|set| **set).count() {
            0 => return Err(self.invalid("one of cron, interval_secs, run_at or delay_secs is required")),
            1 => {}
            _ => return Err(self.invalid("only one of cron, interval_secs, run_at or delay_secs may be set")),
        }

        let schedule = if let Some(expr) = &self.cron {
            let tz = match &self.timezone {
                Some(name) => name
                    .parse::<Tz>()
                    .map_err(|_| self.invalid(format!("invalid timezone '{}'", name)))?,
                None => default_tz,
            };
            ScheduleSpec::cron_in(expr, tz)
        } else if let Some(secs) = self.interval_secs {
            ScheduleSpec::every(Duration::from_secs(secs))
        } else if let Some(at) = self.run_at {
            Ok(ScheduleSpec::at(at))
        } else {
            ScheduleSpec::delay(Duration::from_secs(self.delay_secs.unwrap_or_default()))
        };
        schedule.map_err(|e| self.invalid(e.to_string()))
    }

    /// Working directory with `~` and environment variables expanded.
    pub fn expanded_working_dir(&self) -> Result<Option<PathBuf>, DaemonError> {
        self.working_dir
            .as_deref()
            .map(|dir| {
                shellexpand::full(dir)
                    .map(|expanded| PathBuf::from(expanded.as_ref()))
                    .map_err(|e| self.invalid(format!("working_dir: {}", e)))
            })
            .transpose()
    }

    /// `env` entries split into pairs.
    pub fn env_pairs(&self) -> Result<Vec<(String, String)>, DaemonError> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(self.invalid(format!("env entry '{}' is not KEY=VALUE", entry))),
            })
            .collect()
    }

    /// Build the scheduler definition for this entry.
    pub fn to_definition(&self, default_tz: Tz) -> Result<JobDefinition, DaemonError> {
        if self.command.trim().is_empty() {
            return Err(self.invalid("command must not be empty"));
        }

        let schedule = self.schedule(default_tz)?;
        let handler = CommandHandler::new(&self.command)
            .args(self.args.clone())
            .working_dir(self.expanded_working_dir()?)
            .envs(self.env_pairs()?)
            .non_retryable_exit_codes(self.non_retryable_exit_codes.clone());

        let overlap = match self.overlap {
            OverlapMode::Skip => OverlapPolicy::Skip,
            OverlapMode::Queue => OverlapPolicy::Queue {
                max_depth: self.queue_depth,
            },
        };

        let mut builder = JobDefinition::builder(self.name.clone(), schedule, handler)
            .max_concurrency(self.max_concurrency)
            .overlap(overlap)
            .retry(self.retry.to_policy())
            .lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .jitter(JitterConfig::from_secs(self.jitter_secs));
        if let Some(secs) = self.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if !self.distributed {
            builder = builder.local_only();
        }
        Ok(builder.build()?)
    }
}

impl Settings {
    /// Load settings from all sources.
    ///
    /// # Errors
    ///
    /// A missing `--config` file, unreadable TOML, or values of the wrong type.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, DaemonError> {
        let default_config_path = config_dir().join("config");

        let mut builder = Config::builder()
            // 1. Built-in defaults
            .set_default("log_level", default_log_level())?
            // 2. Default config file (~/.config/fleet-scheduler/config.toml)
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        // 3. CLI-specified config file (higher precedence than default)
        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // 4. Environment variables (highest precedence before CLI flags)
        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Scheduler definitions for every `[[jobs]]` entry.
    pub fn job_definitions(&self) -> Result<Vec<JobDefinition>, DaemonError> {
        let tz = self.scheduler.parse_timezone()?;
        self.jobs.iter().map(|job| job.to_definition(tz)).collect()
    }

    /// Effective settings rendered as TOML.
    pub fn to_toml(&self) -> Result<String, DaemonError> {
        toml::to_string_pretty(self).map_err(|e| DaemonError::Config(e.to_string()))
    }
}

/// Directory of the default config file.
pub fn config_dir() -> PathBuf {
    ProjectDirs::from("", "", "fleet-scheduler")
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
