// src/job/spec.rs

use std::fmt;

use serde_json::Value;

use crate::engine::local::LocalAction;
use crate::job::JobName;

/// What kind of work a job is. Dispatched once, at launch time.
#[derive(Clone)]
pub enum JobKind {
    /// Submitted to the execution backend; `payload` is opaque to the engine.
    Remote { payload: Value },
    /// An in-process async function wrapped as a pseudo-job.
    Local { action: LocalAction },
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Remote { payload } => f.debug_struct("Remote").field("payload", payload).finish(),
            JobKind::Local { .. } => f.debug_struct("Local").finish_non_exhaustive(),
        }
    }
}

/// One entry of the ordered job list. Unique by `name` within a sequence.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: JobName,
    pub kind: JobKind,
}

impl JobSpec {
    pub fn remote(name: impl Into<JobName>, payload: Value) -> Self {
        Self {
            name: name.into(),
            kind: JobKind::Remote { payload },
        }
    }

    pub fn local(name: impl Into<JobName>, action: LocalAction) -> Self {
        Self {
            name: name.into(),
            kind: JobKind::Local { action },
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, JobKind::Local { .. })
    }
}
