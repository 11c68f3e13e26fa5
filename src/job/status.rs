// src/job/status.rs

//! Persisted job-status ledger.
//!
//! `GlobalStatus` is the single source of truth for resuming a sequence after
//! the controlling process restarts. It holds exactly one `JobStatus` per job
//! name ever seen; entries for jobs outside the current sequence are kept
//! untouched. Transitions are validated so that a job only moves forward
//! within one attempt; [`GlobalStatus::retry`] is the only way back.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::{CorrelationId, JobName};
use crate::types::JobState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: JobName,
    /// Absent until launched, and for local jobs without a backend id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub state: JobState,
}

impl JobStatus {
    pub fn new(name: impl Into<JobName>) -> Self {
        Self {
            name: name.into(),
            correlation_id: None,
            state: JobState::NotStarted,
        }
    }
}

/// Rejected ledger transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job '{job}' cannot move from {from} to {to}")]
    Invalid {
        job: JobName,
        from: JobState,
        to: JobState,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalStatus {
    jobs: Vec<JobStatus>,
}

impl GlobalStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_statuses(jobs: Vec<JobStatus>) -> Self {
        let mut status = Self::new();
        for job in jobs {
            match status.jobs.iter_mut().find(|j| j.name == job.name) {
                Some(existing) => {
                    warn!(job = %job.name, "duplicate ledger entry; keeping the last one");
                    *existing = job;
                }
                None => status.jobs.push(job),
            }
        }
        status
    }

    pub fn get(&self, name: &str) -> Option<&JobStatus> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// State of `name`, treating unknown jobs as `NotStarted`.
    pub fn state_of(&self, name: &str) -> JobState {
        self.get(name).map(|j| j.state).unwrap_or_default()
    }

    pub fn correlation_id_of(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|j| j.correlation_id.as_deref())
    }

    /// The job currently marked `InProgress`, if any.
    pub fn in_progress(&self) -> Option<&JobStatus> {
        self.jobs.iter().find(|j| j.state == JobState::InProgress)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobStatus> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn entry_mut(&mut self, name: &str) -> &mut JobStatus {
        let idx = match self.jobs.iter().position(|j| j.name == name) {
            Some(idx) => idx,
            None => {
                self.jobs.push(JobStatus::new(name));
                self.jobs.len() - 1
            }
        };
        &mut self.jobs[idx]
    }

    /// Mark `name` as launched. An `InProgress` entry may be relaunched when
    /// it never received a correlation id (an interrupted local job).
    pub fn mark_in_progress(
        &mut self,
        name: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<(), TransitionError> {
        if let Some(other) = self
            .jobs
            .iter()
            .find(|j| j.state == JobState::InProgress && j.name != name)
        {
            warn!(
                job = %name,
                other = %other.name,
                "another job is still marked in progress in the ledger"
            );
        }

        let entry = self.entry_mut(name);
        match entry.state {
            JobState::NotStarted | JobState::InProgress => {
                debug!(job = %name, id = ?correlation_id, "ledger: in progress");
                entry.state = JobState::InProgress;
                entry.correlation_id = correlation_id;
                Ok(())
            }
            from => Err(TransitionError::Invalid {
                job: name.to_string(),
                from,
                to: JobState::InProgress,
            }),
        }
    }

    /// Replace the correlation id of an in-progress job (e.g. a follow-up
    /// sub-process spawned by a batch call).
    pub fn set_correlation_id(
        &mut self,
        name: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), TransitionError> {
        let entry = self.entry_mut(name);
        if entry.state != JobState::InProgress {
            return Err(TransitionError::Invalid {
                job: name.to_string(),
                from: entry.state,
                to: JobState::InProgress,
            });
        }
        entry.correlation_id = Some(correlation_id);
        Ok(())
    }

    pub fn mark_complete(&mut self, name: &str) -> Result<(), TransitionError> {
        self.finish(name, JobState::Complete)
    }

    /// `NotStarted -> Failed` is allowed for launch rejections.
    pub fn mark_failed(&mut self, name: &str) -> Result<(), TransitionError> {
        self.finish(name, JobState::Failed)
    }

    fn finish(&mut self, name: &str, to: JobState) -> Result<(), TransitionError> {
        let entry = self.entry_mut(name);
        let allowed = match (entry.state, to) {
            (JobState::InProgress, _) => true,
            (JobState::NotStarted, JobState::Failed) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError::Invalid {
                job: name.to_string(),
                from: entry.state,
                to,
            });
        }
        debug!(job = %name, state = ?to, "ledger: terminal");
        entry.state = to;
        Ok(())
    }

    /// Explicit user retry: clear the job's correlation id and state.
    ///
    /// Returns `false` if the job is unknown.
    pub fn retry(&mut self, name: &str) -> bool {
        match self.jobs.iter_mut().find(|j| j.name == name) {
            Some(entry) => {
                entry.state = JobState::NotStarted;
                entry.correlation_id = None;
                true
            }
            None => false,
        }
    }
}
