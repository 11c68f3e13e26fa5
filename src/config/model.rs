// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::backend::markers::{DEFAULT_ERROR_MARKER, DEFAULT_START_MARKER, DEFAULT_STOP_MARKER};
use crate::backend::{EventMarkers, ProcessBackendOptions};
use crate::engine::EngineOptions;
use crate::job::{JobSpec, Step};
use crate::types::{CompletionPolicy, ConfirmPolicy};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// state_file = ".jobtrain/status.json"
/// on_partial_failure = "ask"
///
/// [backend]
/// work_dir = ".jobtrain/jobs"
///
/// [[job]]
/// name = "wipe"
/// payload = { cmd = "ansible-playbook wipe.yml", playbook = "wipe.yml" }
///
/// [[job]]
/// name = "settle"
/// kind = "local"
/// delay = "5s"
///
/// [[step]]
/// label = "Wipe disks"
/// events = ["wipe.yml"]
/// ```
///
/// Jobs run in the order they are declared.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub backend: BackendSection,

    #[serde(default, rename = "job")]
    pub jobs: Vec<JobConfig>,

    #[serde(default, rename = "step")]
    pub steps: Vec<StepConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Where the job-status ledger is persisted.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Duration string, e.g. `"250ms"`.
    #[serde(default = "default_log_flush_interval")]
    pub log_flush_interval: String,

    /// Duration string, e.g. `"2s"`.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,

    /// `"ask"` (default), `"continue"` or `"abort"`.
    #[serde(default)]
    pub on_partial_failure: ConfirmPolicy,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".jobtrain/status.json")
}

fn default_log_flush_interval() -> String {
    "250ms".to_string()
}

fn default_reconnect_delay() -> String {
    "2s".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            log_flush_interval: default_log_flush_interval(),
            reconnect_delay: default_reconnect_delay(),
            on_partial_failure: ConfirmPolicy::default(),
        }
    }
}

/// `[backend]` section: the local process backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Regexes with a named group `event`, matched against job stdout.
    #[serde(default = "default_start_marker")]
    pub start_marker: String,
    #[serde(default = "default_stop_marker")]
    pub stop_marker: String,
    #[serde(default = "default_error_marker")]
    pub error_marker: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".jobtrain/jobs")
}

fn default_start_marker() -> String {
    DEFAULT_START_MARKER.to_string()
}

fn default_stop_marker() -> String {
    DEFAULT_STOP_MARKER.to_string()
}

fn default_error_marker() -> String {
    DEFAULT_ERROR_MARKER.to_string()
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            start_marker: default_start_marker(),
            stop_marker: default_stop_marker(),
            error_marker: default_error_marker(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKindConfig {
    #[default]
    Remote,
    Local,
}

/// `[[job]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,

    #[serde(default)]
    pub kind: JobKindConfig,

    /// Remote jobs: handed to the backend as-is. The process backend needs
    /// `cmd` and reads an optional `playbook` event name.
    #[serde(default)]
    pub payload: Option<Value>,

    /// Local jobs: shell command run in-process.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Local jobs: wait this long (duration string).
    #[serde(default)]
    pub delay: Option<String>,
}

/// `[[step]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub label: String,

    #[serde(default)]
    pub events: Vec<String>,

    /// `"all_of"` (default) or `"any_of"`.
    #[serde(default)]
    pub policy: CompletionPolicy,
}

/// Validated configuration. Built from [`RawConfigFile`] with `TryFrom`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSettings,
    pub backend: ProcessBackendOptions,
    pub jobs: Vec<JobSpec>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub state_file: PathBuf,
    pub log_flush_interval: Duration,
    pub reconnect_delay: Duration,
    pub on_partial_failure: ConfirmPolicy,
}

impl EngineSettings {
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            log_flush_interval: self.log_flush_interval,
            reconnect_delay: self.reconnect_delay,
        }
    }
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineSettings,
        work_dir: PathBuf,
        markers: EventMarkers,
        jobs: Vec<JobSpec>,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            engine,
            backend: ProcessBackendOptions { work_dir, markers },
            jobs,
            steps,
        }
    }
}
