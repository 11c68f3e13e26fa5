// src/engine/core.rs

//! Pure resume planner.
//!
//! Given the ordered job list and the persisted ledger, decide where a
//! sequence picks up: which jobs are already done, and whether the next
//! action is a fresh launch, a reattach to a running job, a halt on a
//! recorded failure, or nothing at all.
//!
//! No Tokio, channels, or IO here; the sequencer only executes the plan.

use tracing::warn;

use crate::job::{CorrelationId, GlobalStatus, JobSpec};
use crate::types::JobState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Submit / start the job at this index.
    Launch(usize),
    /// The job is still running under `correlation_id`; do not resubmit.
    Reattach {
        index: usize,
        correlation_id: CorrelationId,
    },
    /// The job at this index is recorded as failed, or is a remote job
    /// left in progress without a correlation id.
    Halted { index: usize },
    /// Every job is complete.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Indices of jobs skipped because the ledger has them complete.
    pub completed: Vec<usize>,
    pub point: ResumePoint,
}

/// Plan from the beginning of the list. Called once per start.
pub fn plan_resume(specs: &[JobSpec], ledger: &GlobalStatus) -> ResumePlan {
    plan_from(specs, ledger, 0)
}

/// Plan starting at `start`. Advancing after a completed job is
/// `plan_from(index + 1)`: purely positional.
pub fn plan_from(specs: &[JobSpec], ledger: &GlobalStatus, start: usize) -> ResumePlan {
    let mut completed = Vec::new();

    for (index, spec) in specs.iter().enumerate().skip(start) {
        let point = match ledger.state_of(&spec.name) {
            JobState::Complete => {
                completed.push(index);
                continue;
            }
            JobState::Failed => ResumePoint::Halted { index },
            JobState::InProgress => match ledger.correlation_id_of(&spec.name) {
                Some(id) => ResumePoint::Reattach {
                    index,
                    correlation_id: id.to_string(),
                },
                // Only a local action can be restarted safely. A remote job
                // gets here when the process stopped during confirmation;
                // submitting it again could repeat work, so it halts.
                None if spec.is_local() => {
                    warn!(
                        job = %spec.name,
                        "local job was in progress; running it again"
                    );
                    ResumePoint::Launch(index)
                }
                None => {
                    warn!(
                        job = %spec.name,
                        "remote job was in progress without a correlation id; halting"
                    );
                    ResumePoint::Halted { index }
                }
            },
            JobState::NotStarted => ResumePoint::Launch(index),
        };
        return ResumePlan { completed, point };
    }

    ResumePlan {
        completed,
        point: ResumePoint::Finished,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs(names: &[&str]) -> Vec<JobSpec> {
        names
            .iter()
            .map(|n| JobSpec::remote(*n, json!({ "cmd": "true" })))
            .collect()
    }

    #[test]
    fn empty_ledger_launches_first_job() {
        let plan = plan_resume(&specs(&["a", "b"]), &GlobalStatus::new());
        assert_eq!(plan.completed, Vec::<usize>::new());
        assert_eq!(plan.point, ResumePoint::Launch(0));
    }

    #[test]
    fn complete_jobs_are_skipped_and_running_job_is_reattached() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_in_progress("a", Some("1".into())).unwrap();
        ledger.mark_complete("a").unwrap();
        ledger.mark_in_progress("b", Some("42".into())).unwrap();

        let plan = plan_resume(&specs(&["a", "b", "c"]), &ledger);
        assert_eq!(plan.completed, vec![0]);
        assert_eq!(
            plan.point,
            ResumePoint::Reattach {
                index: 1,
                correlation_id: "42".into()
            }
        );
    }

    #[test]
    fn failed_job_halts() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_failed("a").unwrap();
        let plan = plan_resume(&specs(&["a", "b"]), &ledger);
        assert_eq!(plan.point, ResumePoint::Halted { index: 0 });
    }

    #[test]
    fn local_in_progress_without_id_is_relaunched() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_in_progress("settle", None).unwrap();
        let specs = vec![JobSpec::local(
            "settle",
            crate::actions::delay(std::time::Duration::from_secs(1)),
        )];
        let plan = plan_resume(&specs, &ledger);
        assert_eq!(plan.point, ResumePoint::Launch(0));
    }

    #[test]
    fn remote_in_progress_without_id_halts() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_in_progress("update", None).unwrap();
        let plan = plan_resume(&specs(&["update", "next"]), &ledger);
        assert_eq!(plan.point, ResumePoint::Halted { index: 0 });
    }

    #[test]
    fn all_complete_is_finished() {
        let mut ledger = GlobalStatus::new();
        for name in ["a", "b"] {
            ledger.mark_in_progress(name, None).unwrap();
            ledger.mark_complete(name).unwrap();
        }
        let plan = plan_resume(&specs(&["a", "b"]), &ledger);
        assert_eq!(plan.completed, vec![0, 1]);
        assert_eq!(plan.point, ResumePoint::Finished);
    }

    #[test]
    fn advancing_is_positional() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_in_progress("b", None).unwrap();
        ledger.mark_complete("b").unwrap();

        // "a" was never run, but advancing from index 1 does not look back.
        let plan = plan_from(&specs(&["a", "b", "c"]), &ledger, 1);
        assert_eq!(plan.completed, vec![1]);
        assert_eq!(plan.point, ResumePoint::Launch(2));
    }

    #[test]
    fn unknown_ledger_entries_are_ignored() {
        let mut ledger = GlobalStatus::new();
        ledger.mark_failed("old-job").unwrap();
        let plan = plan_resume(&specs(&["a"]), &ledger);
        assert_eq!(plan.point, ResumePoint::Launch(0));
    }
}
