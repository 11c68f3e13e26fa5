// src/backend/markers.rs

//! Stdout markers that turn process output into sub-events.
//!
//! A playbook that runs several sub-playbooks prints a marker line per
//! boundary, e.g. `::start network.yml` / `::stop network.yml`. Each pattern
//! must have a named capture group `event`. Lines that match no marker are
//! plain log lines.

use regex::Regex;

use crate::errors::{JobtrainError, Result};
use crate::job::{EventKind, EventRecord};

pub const DEFAULT_START_MARKER: &str = r"^::start\s+(?P<event>\S+)";
pub const DEFAULT_STOP_MARKER: &str = r"^::stop\s+(?P<event>\S+)";
pub const DEFAULT_ERROR_MARKER: &str = r"^::error\s+(?P<event>\S+)\s*(?P<message>.*)$";

#[derive(Debug, Clone)]
pub struct EventMarkers {
    start: Regex,
    stop: Regex,
    error: Regex,
}

impl EventMarkers {
    pub fn new(start: &str, stop: &str, error: &str) -> Result<Self> {
        Ok(Self {
            start: compile("start_marker", start)?,
            stop: compile("stop_marker", stop)?,
            error: compile("error_marker", error)?,
        })
    }

    /// Classify one stdout line. `None` means "plain log line".
    pub fn classify(&self, line: &str) -> Option<EventRecord> {
        if let Some(caps) = self.error.captures(line) {
            let event = caps.name("event")?.as_str();
            let message = caps
                .name("message")
                .map(|m| m.as_str().trim())
                .filter(|m| !m.is_empty())
                .unwrap_or("reported an error");
            return Some(EventRecord::error(event, message));
        }

        for (re, kind) in [(&self.start, EventKind::Start), (&self.stop, EventKind::Stop)] {
            if let Some(caps) = re.captures(line) {
                let event = caps.name("event")?.as_str();
                return Some(EventRecord::new(event, kind));
            }
        }

        None
    }
}

impl Default for EventMarkers {
    fn default() -> Self {
        Self {
            start: Regex::new(DEFAULT_START_MARKER).expect("default start marker is valid"),
            stop: Regex::new(DEFAULT_STOP_MARKER).expect("default stop marker is valid"),
            error: Regex::new(DEFAULT_ERROR_MARKER).expect("default error marker is valid"),
        }
    }
}

fn compile(field: &str, pattern: &str) -> Result<Regex> {
    let re = Regex::new(pattern).map_err(|e| {
        JobtrainError::ConfigError(format!("[backend].{field} is not a valid regex: {e}"))
    })?;
    if re.capture_names().flatten().all(|name| name != "event") {
        return Err(JobtrainError::ConfigError(format!(
            "[backend].{field} must contain a named group (?P<event>...)"
        )));
    }
    Ok(re)
}
