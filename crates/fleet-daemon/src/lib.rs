//! Fleet daemon library exports.
//!
//! This crate provides the CLI daemon binary that hosts a fleet scheduler
//! and runs configured commands as jobs.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (start, stop, status, validate, next, config)
//! - `handler`: Job handler that runs an external command
//! - `pidfile`: PID file tracking the running daemon
//! - `settings`: Layered configuration and `[[jobs]]` tables

pub mod cli;
pub mod commands;
pub mod error;
pub mod handler;
pub mod pidfile;
pub mod settings;

pub use cli::{Cli, Commands};
pub use commands::{
    show_config, show_next, show_status, spawn_event_tally, start_daemon, stop_daemon,
    upcoming_fire_times, validate_config, OutcomeTally,
};
pub use error::DaemonError;
pub use handler::CommandHandler;
pub use pidfile::{DaemonState, PidFile};
pub use settings::{config_dir, JobSettings, OverlapMode, RetrySettings, Settings};
