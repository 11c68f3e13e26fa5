// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `jobtrain`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobtrain",
    version,
    about = "Run an ordered train of installer jobs, resuming where the last run stopped.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Jobtrain.toml")]
    pub config: String,

    /// Override `[engine].state_file` (the persisted job-status ledger).
    #[arg(long, value_name = "PATH")]
    pub state: Option<String>,

    /// Clear the failed state of this job before running, so the sequence
    /// resumes at it.
    #[arg(long, value_name = "JOB")]
    pub retry: Option<String>,

    /// Forget all persisted job statuses and start from the first job.
    #[arg(long)]
    pub reset: bool,

    /// Continue past partial failures without prompting.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBTRAIN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print jobs, steps and the resume point, but don't
    /// launch anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
