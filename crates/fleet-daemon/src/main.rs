//! Fleet Scheduler Daemon
//!
//! Runs configured commands as scheduled jobs, with fleet-wide exclusion,
//! per-job concurrency limits and retry with backoff.
//!
//! # Usage
//!
//! ```bash
//! fleet-daemon start [--foreground] [--instance-id ID]
//! fleet-daemon stop
//! fleet-daemon status
//! fleet-daemon validate [-n COUNT]
//! fleet-daemon next "0 9 * * MON-FRI" [-n COUNT] [--timezone TZ]
//! fleet-daemon config
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/fleet-scheduler/config.toml)
//! 3. Config file given with `--config`
//! 4. Environment variables (FLEET_*)
//! 5. CLI flags

use anyhow::Result;
use clap::Parser;

use fleet_daemon::{
    show_config, show_next, show_status, start_daemon, stop_daemon, validate_config, Cli,
    Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            foreground,
            instance_id,
        } => {
            start_daemon(
                cli.config.as_deref(),
                foreground,
                instance_id.as_deref(),
                cli.log_level.as_deref(),
            )
            .await?;
        }
        Commands::Stop => {
            stop_daemon()?;
        }
        Commands::Status => {
            show_status()?;
        }
        Commands::Validate { count } => {
            validate_config(cli.config.as_deref(), count)?;
        }
        Commands::Next {
            expression,
            count,
            timezone,
        } => {
            show_next(cli.config.as_deref(), &expression, count, timezone.as_deref())?;
        }
        Commands::Config => {
            show_config(cli.config.as_deref())?;
        }
    }

    Ok(())
}
