mod common;
use crate::common::{final_status, init_tracing, is_launch_of, read_until};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobtrain::actions;
use jobtrain::engine::{CancelHandle, Confirmer, Decision, FailureKind, SequenceEvent};
use jobtrain::job::{EventRecord, GlobalStatus};
use jobtrain::store::{MemoryStatusStore, StatusStore};
use jobtrain::types::JobState;
use jobtrain_test_utils::builders::{local, remote, remotes, SequencerBuilder};
use jobtrain_test_utils::{drain, FakeBackend, JobScript};

#[tokio::test]
async fn cancel_fails_current_job_and_launches_nothing_after_it() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.script("b", JobScript::hangs([EventRecord::start("b.yml")]));
    let store = Arc::new(MemoryStatusStore::default());

    let sequencer = SequencerBuilder::new(&backend).store(Arc::clone(&store)).build();
    let mut run = sequencer
        .run(remotes(&["a", "b", "c"]), Vec::new(), GlobalStatus::new())
        .unwrap();

    read_until(&mut run, |e| is_launch_of(e, "b")).await;
    run.cancel();

    let (events, outcome) = drain(run).await;

    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Cancelled)));
    assert_eq!(backend.submitted(), vec!["a", "b"]);
    assert_eq!(backend.cancelled(), vec!["2"]);

    let ledger = store.load().unwrap();
    assert_eq!(ledger.state_of("a"), JobState::Complete);
    assert_eq!(ledger.state_of("b"), JobState::Failed);
    assert_eq!(ledger.state_of("c"), JobState::NotStarted);
    assert_eq!(outcome.ledger, ledger);
}

#[tokio::test]
async fn cancel_before_first_launch_submits_nothing() {
    init_tracing();

    let backend = FakeBackend::new();
    let sequencer = SequencerBuilder::new(&backend).build();
    let run = sequencer
        .run(remotes(&["a", "b"]), Vec::new(), GlobalStatus::new())
        .unwrap();
    // The driver has not run yet; the cancel is already waiting for it.
    run.cancel();

    let (events, outcome) = drain(run).await;
    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Cancelled)));
    assert!(backend.calls().is_empty(), "unexpected calls {:?}", backend.calls());
    assert_eq!(outcome.ledger.state_of("a"), JobState::NotStarted);
    assert_eq!(outcome.ledger.state_of("b"), JobState::NotStarted);
}

/// Accepts the partial failure, but cancels the run while answering.
#[derive(Default)]
struct CancellingConfirmer(Mutex<Option<CancelHandle>>);

#[async_trait]
impl Confirmer for CancellingConfirmer {
    async fn confirm(&self, _message: &str) -> Decision {
        if let Some(handle) = self.0.lock().unwrap().as_ref() {
            handle.cancel();
        }
        Decision::Continue
    }
}

#[tokio::test]
async fn cancel_raised_as_a_job_completes_stops_the_next_launch() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.script("deploy", JobScript::partial("node2 unreachable", None));
    let confirmer = Arc::new(CancellingConfirmer::default());

    let sequencer = jobtrain::engine::JobSequencer::new(
        Arc::new(backend.clone()),
        Arc::new(MemoryStatusStore::default()),
        confirmer.clone(),
        jobtrain_test_utils::builders::test_options(),
    );
    let run = sequencer
        .run(remotes(&["deploy", "next"]), Vec::new(), GlobalStatus::new())
        .unwrap();
    *confirmer.0.lock().unwrap() = Some(run.cancel_handle());

    let (events, outcome) = drain(run).await;

    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Cancelled)));
    assert_eq!(backend.submitted(), vec!["deploy"]);
    assert_eq!(outcome.ledger.state_of("deploy"), JobState::Complete);
    assert_eq!(outcome.ledger.state_of("next"), JobState::NotStarted);
}

#[tokio::test]
async fn cancel_handle_outlives_borrow_of_run() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.script("a", JobScript::hangs(Vec::new()));

    let sequencer = SequencerBuilder::new(&backend).build();
    let mut run = sequencer
        .run(remotes(&["a"]), Vec::new(), GlobalStatus::new())
        .unwrap();
    let handle = run.cancel_handle();

    read_until(&mut run, |e| is_launch_of(e, "a")).await;
    tokio::spawn(async move { handle.cancel() });

    let (_, outcome) = drain(run).await;
    assert_eq!(outcome.error.map(|e| e.kind), Some(FailureKind::Cancelled));
}

#[tokio::test]
async fn cancelling_a_local_action_does_not_touch_the_backend() {
    init_tracing();

    let backend = FakeBackend::new();
    let sequencer = SequencerBuilder::new(&backend).build();
    let specs = vec![
        local("pause", actions::delay(Duration::from_secs(60))),
        remote("after"),
    ];
    let mut run = sequencer.run(specs, Vec::new(), GlobalStatus::new()).unwrap();

    read_until(&mut run, |e| is_launch_of(e, "pause")).await;
    run.cancel();

    let (_, outcome) = drain(run).await;
    assert_eq!(outcome.ledger.state_of("pause"), JobState::Failed);
    assert!(backend.calls().is_empty());
}

/// Never answers.
struct SilentConfirmer;

#[async_trait]
impl Confirmer for SilentConfirmer {
    async fn confirm(&self, _message: &str) -> Decision {
        std::future::pending().await
    }
}

#[tokio::test]
async fn cancel_while_waiting_for_confirmation() {
    init_tracing();

    let backend = FakeBackend::new();
    backend.script("deploy", JobScript::partial("node2 unreachable", None));

    let sequencer = jobtrain::engine::JobSequencer::new(
        Arc::new(backend.clone()),
        Arc::new(MemoryStatusStore::default()),
        Arc::new(SilentConfirmer),
        jobtrain_test_utils::builders::test_options(),
    );
    let mut run = sequencer
        .run(remotes(&["deploy", "next"]), Vec::new(), GlobalStatus::new())
        .unwrap();

    let seen = read_until(&mut run, |e| {
        matches!(e, SequenceEvent::ConfirmationRequested { .. })
    })
    .await;
    match seen.last() {
        Some(SequenceEvent::ConfirmationRequested { job, message }) => {
            assert_eq!(job, "deploy");
            assert!(message.contains("node2 unreachable"));
        }
        other => panic!("unexpected {other:?}"),
    }
    run.cancel();

    let (events, outcome) = drain(run).await;
    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Cancelled)));
    assert_eq!(outcome.ledger.state_of("deploy"), JobState::Failed);
    assert_eq!(backend.submitted(), vec!["deploy"]);
}
