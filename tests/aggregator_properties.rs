use std::collections::HashSet;

use proptest::prelude::*;
use jobtrain::engine::ProgressAggregator;
use jobtrain::job::{EventKind, EventRecord, Step};
use jobtrain::types::{CompletionPolicy, JobState};

const NAMES: [&str; 5] = ["wipe.yml", "net.yml", "ceph.yml", "site.yml", "verify.yml"];

fn event_strategy() -> impl Strategy<Value = EventRecord> {
    (0..NAMES.len(), 0..3u8).prop_map(|(i, k)| {
        let kind = match k {
            0 => EventKind::Start,
            1 => EventKind::Stop,
            _ => EventKind::Error,
        };
        EventRecord::new(NAMES[i], kind)
    })
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (
        proptest::collection::hash_set(0..NAMES.len(), 1..=3),
        any::<bool>(),
    )
        .prop_map(|(idx, any_of)| {
            let policy = if any_of {
                CompletionPolicy::AnyOf
            } else {
                CompletionPolicy::AllOf
            };
            let mut names: Vec<&str> = idx.into_iter().map(|i| NAMES[i]).collect();
            names.sort();
            Step::new(names.join("+"), names, policy)
        })
}

// Reference reduction over plain sets of event names.
fn expected(step: &Step, events: &[EventRecord]) -> JobState {
    let seen = |kind: EventKind| -> HashSet<&str> {
        events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.event_name.as_str())
            .collect()
    };
    let started = seen(EventKind::Start);
    let stopped = seen(EventKind::Stop);
    let failed = seen(EventKind::Error);
    let names = &step.event_names;

    if names.iter().any(|n| failed.contains(n.as_str())) {
        return JobState::Failed;
    }
    let complete = match step.policy {
        CompletionPolicy::AnyOf => names.iter().any(|n| stopped.contains(n.as_str())),
        CompletionPolicy::AllOf => names.iter().all(|n| stopped.contains(n.as_str())),
    };
    if complete {
        JobState::Complete
    } else if names
        .iter()
        .any(|n| started.contains(n.as_str()) && !stopped.contains(n.as_str()))
    {
        JobState::InProgress
    } else {
        JobState::NotStarted
    }
}

proptest! {
    #[test]
    fn step_status_follows_precedence(
        steps in proptest::collection::vec(step_strategy(), 1..4),
        events in proptest::collection::vec(event_strategy(), 0..20),
    ) {
        // A trailing step stand-in keeps the last-step shortcut out of play.
        let mut all_steps = steps.clone();
        all_steps.push(Step::all_of("tail", ["never.yml"]));

        let mut agg = ProgressAggregator::new(all_steps);
        for event in &events {
            agg.apply("job", event);
        }

        for (i, step) in steps.iter().enumerate() {
            prop_assert_eq!(agg.step_status(i), expected(step, &events));
        }
    }

    #[test]
    fn terminal_steps_stay_terminal(
        step in step_strategy(),
        events in proptest::collection::vec(event_strategy(), 0..20),
    ) {
        let mut agg = ProgressAggregator::new(vec![step, Step::all_of("tail", ["never.yml"])]);
        let mut reached: Option<JobState> = None;

        for event in &events {
            agg.apply("job", event);
            let now = agg.step_status(0);
            if let Some(prev) = reached {
                // Complete may still turn Failed; nothing goes backwards.
                match prev {
                    JobState::Failed => prop_assert_eq!(now, JobState::Failed),
                    _ => prop_assert!(now.is_terminal()),
                }
            }
            if now.is_terminal() {
                reached = Some(now);
            }
        }
    }
}
