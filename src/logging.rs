// src/logging.rs

//! Logging setup for `jobtrain` using `tracing` + `tracing-subscriber`.
//!
//! Filter resolution:
//! 1. `--log-level` sets one level for everything.
//! 2. Otherwise `JOBTRAIN_LOG` is read as an `EnvFilter` directive list, so
//!    both `debug` and `jobtrain::engine=trace,info` work.
//! 3. Otherwise `info`.
//!
//! Output goes to stderr; stdout is reserved for step progress and job logs.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "JOBTRAIN_LOG";

/// Install the global subscriber. Call once, before the first event.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level.as_directive()),
        None => filter_from_env(std::env::var(LOG_ENV_VAR).ok().as_deref()),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

/// Directives from the environment, falling back to `info` when unset or
/// unparsable.
fn filter_from_env(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
