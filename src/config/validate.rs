// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;

use crate::actions;
use crate::backend::EventMarkers;
use crate::config::model::{
    ConfigFile, EngineSettings, JobConfig, JobKindConfig, RawConfigFile, StepConfig,
};
use crate::errors::{JobtrainError, Result};
use crate::job::{JobSpec, Step};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobtrainError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_jobs(&raw)?;
        ensure_unique_names(&raw)?;

        let engine = EngineSettings {
            log_flush_interval: duration_field(
                "[engine].log_flush_interval",
                &raw.engine.log_flush_interval,
            )?,
            reconnect_delay: duration_field("[engine].reconnect_delay", &raw.engine.reconnect_delay)?,
            state_file: raw.engine.state_file,
            on_partial_failure: raw.engine.on_partial_failure,
        };
        if engine.log_flush_interval.is_zero() {
            return Err(JobtrainError::ConfigError(
                "[engine].log_flush_interval must be greater than zero".to_string(),
            ));
        }

        let markers = EventMarkers::new(
            &raw.backend.start_marker,
            &raw.backend.stop_marker,
            &raw.backend.error_marker,
        )?;

        let jobs = raw
            .jobs
            .into_iter()
            .map(job_spec)
            .collect::<Result<Vec<_>>>()?;
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| step_from(i, step))
            .collect::<Result<Vec<_>>>()?;

        Ok(ConfigFile::new_unchecked(
            engine,
            raw.backend.work_dir,
            markers,
            jobs,
            steps,
        ))
    }
}

fn ensure_has_jobs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.jobs.is_empty() {
        return Err(JobtrainError::ConfigError(
            "config must contain at least one [[job]] entry".to_string(),
        ));
    }
    Ok(())
}

fn ensure_unique_names(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();
    for job in &cfg.jobs {
        if job.name.trim().is_empty() {
            return Err(JobtrainError::ConfigError(
                "every [[job]] needs a non-empty name".to_string(),
            ));
        }
        if !seen.insert(job.name.as_str()) {
            return Err(JobtrainError::ConfigError(format!(
                "job '{}' is declared more than once",
                job.name
            )));
        }
    }
    Ok(())
}

fn job_spec(job: JobConfig) -> Result<JobSpec> {
    match job.kind {
        JobKindConfig::Remote => {
            if job.cmd.is_some() || job.delay.is_some() {
                return Err(JobtrainError::ConfigError(format!(
                    "job '{}': `cmd` and `delay` are for local jobs; put the command in `payload`",
                    job.name
                )));
            }
            let payload = job.payload.ok_or_else(|| {
                JobtrainError::ConfigError(format!("remote job '{}' needs a `payload` table", job.name))
            })?;
            if !matches!(payload.get("cmd"), Some(Value::String(_))) {
                return Err(JobtrainError::ConfigError(format!(
                    "remote job '{}': payload needs a string `cmd`",
                    job.name
                )));
            }
            Ok(JobSpec::remote(job.name, payload))
        }
        JobKindConfig::Local => {
            if job.payload.is_some() {
                return Err(JobtrainError::ConfigError(format!(
                    "local job '{}' does not take a `payload`",
                    job.name
                )));
            }
            let action = match (job.cmd, job.delay) {
                (Some(cmd), None) => actions::shell_command(cmd),
                (None, Some(delay)) => {
                    let field = format!("job '{}' delay", job.name);
                    actions::delay(duration_field(&field, &delay)?)
                }
                _ => {
                    return Err(JobtrainError::ConfigError(format!(
                        "local job '{}' needs exactly one of `cmd` or `delay`",
                        job.name
                    )));
                }
            };
            Ok(JobSpec::local(job.name, action))
        }
    }
}

fn step_from(index: usize, step: StepConfig) -> Result<Step> {
    if step.label.trim().is_empty() {
        return Err(JobtrainError::ConfigError(format!(
            "[[step]] #{} needs a non-empty label",
            index + 1
        )));
    }
    if step.events.is_empty() {
        return Err(JobtrainError::ConfigError(format!(
            "step '{}' must list at least one event",
            step.label
        )));
    }
    Ok(Step::new(step.label, step.events, step.policy))
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value)
        .map_err(|e| JobtrainError::ConfigError(format!("{field}: {e}")))
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
