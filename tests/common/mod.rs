#![allow(dead_code)]

use std::time::Duration;

use jobtrain::engine::{FailureKind, SequenceEvent, SequenceRun};
use jobtrain::types::JobState;

pub use jobtrain_test_utils::init_tracing;

/// Read events until one matches; returns everything read so far.
pub async fn read_until<F>(run: &mut SequenceRun, mut pred: F) -> Vec<SequenceEvent>
where
    F: FnMut(&SequenceEvent) -> bool,
{
    let mut seen = Vec::new();
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = run.next_event().await {
            let hit = pred(&event);
            seen.push(event);
            if hit {
                return true;
            }
        }
        false
    })
    .await
    .expect("timed out waiting for sequence event");
    assert!(found, "sequence ended before the expected event: {seen:#?}");
    seen
}

pub fn is_launch_of(event: &SequenceEvent, job: &str) -> bool {
    matches!(event, SequenceEvent::JobLaunched { name, .. } if name == job)
}

/// Step statuses of the last `Steps` event.
pub fn last_steps(events: &[SequenceEvent]) -> Vec<(String, JobState)> {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            SequenceEvent::Steps(steps) => Some(
                steps
                    .iter()
                    .map(|s| (s.label.clone(), s.status))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

/// The final `Status` report.
pub fn final_status(events: &[SequenceEvent]) -> (JobState, Option<FailureKind>) {
    match events.last() {
        Some(SequenceEvent::Status { status, error }) => (*status, error.as_ref().map(|e| e.kind)),
        other => panic!("expected a Status event last, got {other:?}"),
    }
}

/// Log chunks across all `Log` batches.
pub fn log_chunks(events: &[SequenceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SequenceEvent::Log(chunks) => Some(chunks.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}
