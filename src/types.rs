use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by jobs, steps and the overall sequence.
///
/// Within a single attempt a job only moves forward:
/// `NotStarted -> InProgress -> {Complete | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

impl JobState {
    /// `Complete` or `Failed`: no further events are expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::NotStarted => "not started",
            JobState::InProgress => "in progress",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a step's event names combine into a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every event name must complete.
    #[default]
    AllOf,
    /// A single completed event name is enough.
    AnyOf,
}

impl FromStr for CompletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all_of" | "allof" | "all" => Ok(CompletionPolicy::AllOf),
            "any_of" | "anyof" | "any" => Ok(CompletionPolicy::AnyOf),
            other => Err(format!(
                "invalid completion policy: {other} (expected \"all_of\" or \"any_of\")"
            )),
        }
    }
}

/// What to do when a batch submission reports partial success.
///
/// - `Ask`: prompt the operator and wait for an answer (default).
/// - `Continue`: treat the job as soft-succeeded without prompting.
/// - `Abort`: fail the job without prompting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmPolicy {
    #[default]
    Ask,
    Continue,
    Abort,
}

impl FromStr for ConfirmPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ask" => Ok(ConfirmPolicy::Ask),
            "continue" => Ok(ConfirmPolicy::Continue),
            "abort" => Ok(ConfirmPolicy::Abort),
            other => Err(format!(
                "invalid on_partial_failure: {other} (expected \"ask\", \"continue\" or \"abort\")"
            )),
        }
    }
}
