// src/engine/aggregator.rs

//! Reduce fine-grained job events into UI-facing step states.
//!
//! Per step, with Failed > Complete > InProgress > NotStarted:
//!
//! 1. `Failed` if any of its event names is in the failed set.
//! 2. `Complete` if `AnyOf` and one event name completed, if `AllOf` and all
//!    completed, or if it is the last declared step and the last job of the
//!    sequence completed (covers a multi-event job whose final sub-event
//!    never arrived).
//! 3. `InProgress` if any event name started and is not terminal yet.
//! 4. `NotStarted` otherwise.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::job::{EventKind, EventRecord, JobName, Step};
use crate::types::{CompletionPolicy, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub label: String,
    pub status: JobState,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    steps: Vec<Step>,
    started: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    /// Event names started by each job and not terminal yet.
    in_flight: HashMap<JobName, Vec<String>>,
    /// Jobs that reported at least one Start.
    started_jobs: HashSet<JobName>,
    last_job_complete: bool,
}

impl ProgressAggregator {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Apply one event of `job`. Returns `false` if it changed nothing (a
    /// duplicate Start, a log line).
    pub fn apply(&mut self, job: &str, record: &EventRecord) -> bool {
        let name = record.event_name.as_str();
        match record.kind {
            EventKind::Start => {
                if !self.started.insert(name.to_string()) {
                    return false;
                }
                self.started_jobs.insert(job.to_string());
                self.in_flight
                    .entry(job.to_string())
                    .or_default()
                    .push(name.to_string());
                true
            }
            EventKind::Stop => {
                self.settle(job, name);
                self.completed.insert(name.to_string())
            }
            EventKind::Error => {
                self.settle(job, name);
                self.failed.insert(name.to_string())
            }
            EventKind::Log => false,
        }
    }

    fn settle(&mut self, job: &str, event_name: &str) {
        if let Some(names) = self.in_flight.get_mut(job) {
            names.retain(|n| n != event_name);
        }
    }

    /// The job reached `Complete`; its own name counts as a completed event.
    pub fn job_completed(&mut self, job: &str, is_last: bool) {
        self.in_flight.remove(job);
        self.completed.insert(job.to_string());
        if is_last {
            self.last_job_complete = true;
        }
    }

    /// The job reached `Failed`. Everything it left in flight failed with
    /// it; a job that never started an event fails under its own name.
    pub fn job_failed(&mut self, job: &str) {
        let names = self.in_flight.remove(job).unwrap_or_default();
        if names.is_empty() && !self.started_jobs.contains(job) {
            self.failed.insert(job.to_string());
        }
        for name in names {
            self.failed.insert(name);
        }
    }

    pub fn step_status(&self, index: usize) -> JobState {
        let Some(step) = self.steps.get(index) else {
            return JobState::NotStarted;
        };
        let names = &step.event_names;

        if names.iter().any(|n| self.failed.contains(n)) {
            return JobState::Failed;
        }

        let by_policy = match step.policy {
            CompletionPolicy::AnyOf => names.iter().any(|n| self.completed.contains(n)),
            CompletionPolicy::AllOf => names.iter().all(|n| self.completed.contains(n)),
        };
        let is_last_step = index + 1 == self.steps.len();
        if by_policy || (is_last_step && self.last_job_complete) {
            return JobState::Complete;
        }

        let in_progress = names.iter().any(|n| {
            self.started.contains(n) && !self.completed.contains(n) && !self.failed.contains(n)
        });
        if in_progress {
            JobState::InProgress
        } else {
            JobState::NotStarted
        }
    }

    pub fn snapshot(&self) -> Vec<StepView> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepView {
                label: step.label.clone(),
                status: self.step_status(i),
            })
            .collect()
    }
}
