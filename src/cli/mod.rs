//! Command-line interface for daybreak.
//!
//! Provides commands for scheduling the daily batch, immediate sends,
//! running workers, monitoring queues, and reading queue status.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
