// src/engine/mod.rs

//! Job sequencing engine.
//!
//! This module ties together:
//! - the resume planner (which job to launch, reattach to, or halt at)
//! - the event monitor (push + poll ingestion of one job's events)
//! - the progress aggregator (events -> UI step states)
//! - the failure arbiter (partial-failure confirmation)
//! - the local action adapter and the display log buffer
//!
//! The pure planning logic lives in [`core`]; the async shell driving one
//! job at a time is implemented in [`sequencer`].

use std::fmt;
use std::time::Duration;

use crate::job::{CorrelationId, EventRecord, JobName};
use crate::types::JobState;

pub mod aggregator;
pub mod arbiter;
pub mod core;
pub mod launcher;
pub mod local;
pub mod log_buffer;
pub mod monitor;
pub mod sequencer;

pub use aggregator::{ProgressAggregator, StepView};
pub use arbiter::{Arbitration, Confirmer, Decision, FailureArbiter, PolicyConfirmer, PromptConfirmer};
pub use self::core::{plan_from, plan_resume, ResumePlan, ResumePoint};
pub use launcher::RemoteJobLauncher;
pub use local::{LocalAction, LocalActionAdapter};
pub use log_buffer::{LogBuffer, LogSink};
pub use monitor::{EventMonitor, JobWatch, WatchItem};
pub use sequencer::{CancelHandle, JobSequencer, SequenceOutcome, SequenceRun};

/// Why a sequence stopped in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend rejected the submission.
    Launch,
    /// A partial failure the operator chose not to accept.
    Partial,
    /// The job (or its follow-up) ended unsuccessfully, or was already
    /// recorded as failed.
    Terminal,
    /// The caller cancelled the in-progress job.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Launch => "launch failure",
            FailureKind::Partial => "partial failure",
            FailureKind::Terminal => "terminal failure",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error carried by an overall `Failed` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceError {
    pub job: JobName,
    pub kind: FailureKind,
    pub message: String,
}

impl SequenceError {
    pub fn new(job: impl Into<JobName>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job '{}': {}: {}", self.job, self.kind, self.message)
    }
}

impl std::error::Error for SequenceError {}

/// Items of the stream returned by [`JobSequencer::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// A job was submitted (or a local action started).
    JobLaunched {
        index: usize,
        name: JobName,
        correlation_id: Option<CorrelationId>,
    },
    /// An already running job was picked up again after a reload.
    JobReattached {
        index: usize,
        name: JobName,
        correlation_id: CorrelationId,
    },
    /// Ledger transition of one job.
    JobState { name: JobName, state: JobState },
    /// A fine-grained event, in arrival order.
    Event { job: JobName, record: EventRecord },
    /// Recomputed status of every declared step.
    Steps(Vec<StepView>),
    /// Coalesced batch of display log chunks.
    Log(Vec<String>),
    /// The sequence is suspended until the confirmer answers.
    ConfirmationRequested { job: JobName, message: String },
    /// Overall status report.
    Status {
        status: JobState,
        error: Option<SequenceError>,
    },
}

/// Tunables of the async shell.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How often buffered log chunks are flushed as one `Log` item.
    pub log_flush_interval: Duration,
    /// Delay before re-polling after a push stream dropped.
    pub reconnect_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            log_flush_interval: Duration::from_millis(250),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}
