mod common;
use crate::common::{final_status, init_tracing, last_steps, log_chunks, read_until};

use std::time::Duration;

use jobtrain::backend::PushEvent;
use jobtrain::engine::{FailureKind, SequenceEvent};
use jobtrain::job::{EventKind, EventRecord, GlobalStatus, Step};
use jobtrain::types::JobState;
use jobtrain_test_utils::builders::{remotes, SequencerBuilder};
use jobtrain_test_utils::{drain, launched, with_timeout, FakeBackend, JobScript};

fn ledger_a_done_b_running(b_id: &str) -> GlobalStatus {
    let mut ledger = GlobalStatus::new();
    ledger.mark_in_progress("a", Some("41".into())).unwrap();
    ledger.mark_complete("a").unwrap();
    ledger.mark_in_progress("b", Some(b_id.into())).unwrap();
    ledger
}

fn steps() -> Vec<Step> {
    vec![
        Step::all_of("A", ["a.yml"]),
        Step::all_of("B", ["b.yml"]),
        Step::all_of("C", ["c.yml"]),
    ]
}

#[tokio::test]
async fn reload_with_finished_job_completes_it_and_launches_next() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.seed_job(
        "41",
        vec![EventRecord::start("a.yml"), EventRecord::stop("a.yml")],
        &[],
        Some(0),
    );
    backend.seed_job(
        "42",
        vec![EventRecord::start("b.yml"), EventRecord::stop("b.yml")],
        &["b: ok"],
        Some(0),
    );
    backend.script(
        "c",
        JobScript::succeeds([EventRecord::start("c.yml"), EventRecord::stop("c.yml")]),
    );

    let sequencer = SequencerBuilder::new(&backend).build();
    let run = sequencer
        .run(remotes(&["a", "b", "c"]), steps(), ledger_a_done_b_running("42"))
        .unwrap();
    let (events, outcome) = drain(run).await;

    // Neither a nor b was submitted again.
    assert_eq!(backend.submitted(), vec!["c"]);
    assert_eq!(launched(&events), vec!["c"]);

    // b was resolved through the poll channel, without subscribing.
    let calls = backend.calls();
    assert!(calls.contains(&"fetch_job_record:42".to_string()));
    assert!(!calls.contains(&"subscribe:42".to_string()));

    assert!(events.iter().any(|e| matches!(
        e,
        SequenceEvent::JobReattached { name, correlation_id, .. } if name == "b" && correlation_id == "42"
    )));
    assert_eq!(outcome.ledger.state_of("b"), JobState::Complete);
    assert_eq!(outcome.ledger.state_of("c"), JobState::Complete);
    assert_eq!(outcome.status, JobState::Complete);

    // a's step was rebuilt from its recorded events; b's log was caught up.
    assert_eq!(last_steps(&events)[0], ("A".to_string(), JobState::Complete));
    assert_eq!(log_chunks(&events), vec!["b: ok"]);
}

#[tokio::test]
async fn reload_with_running_job_catches_up_then_follows_push() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.seed_job("42", vec![EventRecord::start("b.yml")], &[], None);

    let sequencer = SequencerBuilder::new(&backend).build();
    let mut run = sequencer
        .run(remotes(&["a", "b", "c"]), steps(), ledger_a_done_b_running("42"))
        .unwrap();

    read_until(&mut run, |e| {
        matches!(e, SequenceEvent::Event { record, .. } if record.event_name == "b.yml")
    })
    .await;

    with_timeout(async {
        while backend.subscriber_count("42") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    backend.push("42", PushEvent::Event(EventRecord::stop("b.yml")));
    backend.push("42", PushEvent::end(0));

    let (events, outcome) = drain(run).await;

    // The Start caught up by polling is not delivered again when the
    // subscription replays the job from its beginning.
    let b_events: Vec<EventKind> = events
        .iter()
        .filter_map(|e| match e {
            SequenceEvent::Event { job, record } if job == "b" => Some(record.kind),
            _ => None,
        })
        .collect();
    assert_eq!(b_events, vec![EventKind::Start, EventKind::Stop]);

    assert_eq!(backend.submitted(), vec!["c"]);
    assert_eq!(outcome.ledger.state_of("b"), JobState::Complete);
    assert_eq!(outcome.status, JobState::Complete);
}

#[tokio::test]
async fn dropped_push_stream_falls_back_to_polling() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.script("a", JobScript::hangs([EventRecord::start("a.yml")]));

    let sequencer = SequencerBuilder::new(&backend).build();
    let mut run = sequencer
        .run(remotes(&["a"]), vec![Step::all_of("A", ["a.yml"])], GlobalStatus::new())
        .unwrap();

    read_until(&mut run, |e| {
        matches!(e, SequenceEvent::Event { record, .. } if record.event_name == "a.yml")
    })
    .await;

    // The job finishes while nobody is listening.
    backend.drop_subscribers("1");
    backend.push("1", PushEvent::Event(EventRecord::stop("a.yml")));
    backend.push("1", PushEvent::end(0));

    let (events, outcome) = drain(run).await;

    assert_eq!(outcome.status, JobState::Complete);
    assert_eq!(backend.submitted(), vec!["a"]);
    assert!(backend.calls().contains(&"fetch_job_record:1".to_string()));

    let stops = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::Event { record, .. } if record.kind == EventKind::Stop))
        .count();
    assert_eq!(stops, 1);
}

fn seed_finished_b(backend: &FakeBackend) {
    backend.seed_job("41", vec![EventRecord::start("a.yml"), EventRecord::stop("a.yml")], &[], Some(0));
    backend.seed_job(
        "42",
        vec![EventRecord::start("b.yml"), EventRecord::stop("b.yml")],
        &["b: ok"],
        Some(0),
    );
}

fn count_calls(backend: &FakeBackend, call: &str) -> usize {
    backend.calls().iter().filter(|c| c.as_str() == call).count()
}

#[tokio::test]
async fn failing_catch_up_does_not_hide_a_finished_job() {
    init_tracing();

    let backend = FakeBackend::new();
    seed_finished_b(&backend);
    backend
        .fail_calls("fetch_events", usize::MAX)
        .fail_calls("fetch_log", usize::MAX);

    let sequencer = SequencerBuilder::new(&backend).build();
    let run = sequencer
        .run(remotes(&["a", "b", "c"]), steps(), ledger_a_done_b_running("42"))
        .unwrap();
    let (events, outcome) = drain(run).await;

    // The terminal record settled b on the first pass.
    assert_eq!(count_calls(&backend, "fetch_job_record:42"), 1);
    assert_eq!(backend.submitted(), vec!["c"]);
    assert_eq!(outcome.ledger.state_of("b"), JobState::Complete);
    assert_eq!(final_status(&events), (JobState::Complete, None));
}

#[tokio::test]
async fn record_errors_are_retried_without_failing_the_job() {
    init_tracing();

    let backend = FakeBackend::new();
    seed_finished_b(&backend);
    backend.fail_calls("fetch_job_record", 2);

    let sequencer = SequencerBuilder::new(&backend).build();
    let run = sequencer
        .run(remotes(&["a", "b", "c"]), steps(), ledger_a_done_b_running("42"))
        .unwrap();
    let (events, outcome) = drain(run).await;

    assert_eq!(count_calls(&backend, "fetch_job_record:42"), 3);
    assert_eq!(backend.submitted(), vec!["c"]);
    assert_eq!(outcome.ledger.state_of("b"), JobState::Complete);
    assert_eq!(final_status(&events), (JobState::Complete, None));
}

#[tokio::test]
async fn reload_during_confirmation_halts_instead_of_resubmitting() {
    init_tracing();

    // The previous process stopped while asking about a partial failure.
    let mut prior = GlobalStatus::new();
    prior.mark_in_progress("update", None).unwrap();

    let backend = FakeBackend::new();
    let sequencer = SequencerBuilder::new(&backend).build();
    let run = sequencer
        .run(remotes(&["update", "next"]), Vec::new(), prior)
        .unwrap();
    let (events, outcome) = drain(run).await;

    assert!(backend.submitted().is_empty());
    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Terminal)));
    assert!(outcome.error.unwrap().message.contains("retry"));
    assert_eq!(outcome.ledger.state_of("update"), JobState::Failed);
    assert_eq!(outcome.ledger.state_of("next"), JobState::NotStarted);

    // An explicit retry runs it again.
    let mut ledger = outcome.ledger;
    assert!(ledger.retry("update"));
    let run = sequencer
        .run(remotes(&["update", "next"]), Vec::new(), ledger)
        .unwrap();
    let (_, outcome) = drain(run).await;
    assert_eq!(backend.submitted(), vec!["update", "next"]);
    assert_eq!(outcome.status, JobState::Complete);
}
