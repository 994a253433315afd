//! CLI argument parsing for the fleet daemon.
//!
//! CLI flags override every other configuration source.

use clap::{Parser, Subcommand};

/// Fleet Scheduler Daemon
///
/// Runs scheduled commands on one replica of the fleet at a time.
#[derive(Parser, Debug)]
#[command(name = "fleet-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/fleet-scheduler/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,

        /// Override the scheduler instance id used in lease tokens
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Check the configured jobs and print their upcoming fire times
    Validate {
        /// Fire times to print per job
        #[arg(short = 'n', long, default_value = "3")]
        count: usize,
    },

    /// Print upcoming fire times of a cron expression
    Next {
        /// Cron expression (5 or 6 fields)
        expression: String,

        /// Number of fire times
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// IANA timezone (default from config)
        #[arg(short, long)]
        timezone: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}
