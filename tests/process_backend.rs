#![cfg(unix)]

mod common;
use crate::common::{final_status, init_tracing, log_chunks};

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use jobtrain::backend::{
    EventMarkers, ExecutionBackend, ProcessBackend, ProcessBackendOptions, PushEvent, Submission,
};
use jobtrain::engine::{FailureKind, JobSequencer, PolicyConfirmer, Decision};
use jobtrain::fs::RealFileSystem;
use jobtrain::job::{EventKind, EventRecord, GlobalStatus, JobSpec, Step};
use jobtrain::store::{FileStatusStore, StatusStore};
use jobtrain::types::JobState;
use jobtrain_test_utils::builders::test_options;
use jobtrain_test_utils::{drain, with_timeout};

fn backend_in(dir: &Path) -> ProcessBackend {
    ProcessBackend::new(ProcessBackendOptions {
        work_dir: dir.join("jobs"),
        markers: EventMarkers::default(),
    })
}

async fn submit(backend: &ProcessBackend, name: &str, payload: serde_json::Value) -> String {
    match backend.submit(name, &payload).await.unwrap() {
        Submission::Started(id) => id,
        other => panic!("unexpected submission {other:?}"),
    }
}

/// Every pushed item up to and including the terminal one.
async fn collect_push(backend: &ProcessBackend, id: &str) -> Vec<PushEvent> {
    let mut sub = backend.subscribe(id).await.unwrap();
    with_timeout(async {
        let mut items = Vec::new();
        while let Some(item) = sub.next_event().await {
            let end = matches!(item, PushEvent::End { .. });
            items.push(item);
            if end {
                break;
            }
        }
        items
    })
    .await
}

#[tokio::test]
async fn markers_become_events_and_output_is_kept_on_disk() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend = backend_in(dir.path());

    let id = submit(
        &backend,
        "wipe",
        json!({
            "cmd": "echo '::start disks.yml'; echo wiping sdb; echo '::stop disks.yml'",
            "playbook": "wipe.yml",
        }),
    )
    .await;

    let pushed = collect_push(&backend, &id).await;
    assert_eq!(pushed.last(), Some(&PushEvent::end(0)));
    assert!(pushed.contains(&PushEvent::Event(EventRecord::log("wipe.yml", "wiping sdb"))));

    let record = backend.fetch_job_record(&id).await.unwrap();
    assert!(record.is_terminal());
    assert_eq!(record.code, Some(0));
    assert!(!record.killed);

    let events = backend.fetch_events(&id).await.unwrap();
    assert_eq!(
        events,
        vec![
            EventRecord::start("wipe.yml"),
            EventRecord::start("disks.yml"),
            EventRecord::stop("disks.yml"),
            EventRecord::stop("wipe.yml"),
        ]
    );
    assert_eq!(backend.fetch_log(&id).await.unwrap().trim(), "wiping sdb");

    // A late subscriber still sees the job from its beginning.
    let replay = collect_push(&backend, &id).await;
    assert_eq!(replay.first(), Some(&PushEvent::Event(EventRecord::start("wipe.yml"))));
    assert_eq!(replay.last(), Some(&PushEvent::end(0)));
}

#[tokio::test]
async fn failing_command_reports_error_event() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend = backend_in(dir.path());

    let id = submit(&backend, "site", json!({ "cmd": "echo partial; exit 3" })).await;
    let pushed = collect_push(&backend, &id).await;

    assert!(pushed.contains(&PushEvent::Event(EventRecord::error(
        "site",
        "exited with code 3"
    ))));
    assert_eq!(pushed.last(), Some(&PushEvent::end(3)));
    assert_eq!(backend.fetch_job_record(&id).await.unwrap().code, Some(3));
}

#[tokio::test]
async fn cancel_kills_the_process() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend = backend_in(dir.path());

    let id = submit(&backend, "slow", json!({ "cmd": "sleep 30" })).await;
    let mut sub = backend.subscribe(&id).await.unwrap();
    assert_eq!(
        with_timeout(sub.next_event()).await,
        Some(PushEvent::Event(EventRecord::start("slow")))
    );

    backend.cancel(&id).await.unwrap();

    let rest = with_timeout(async {
        let mut items = Vec::new();
        while let Some(item) = sub.next_event().await {
            items.push(item);
        }
        items
    })
    .await;
    assert_eq!(rest.last(), Some(&PushEvent::killed()));

    let record = backend.fetch_job_record(&id).await.unwrap();
    assert!(record.killed);
    // Cancelling a finished job is a no-op.
    backend.cancel(&id).await.unwrap();
}

#[tokio::test]
async fn sequence_runs_shell_jobs_and_persists_ledger() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend: Arc<dyn ExecutionBackend> = Arc::new(backend_in(dir.path()));
    let state_file = dir.path().join("status.json");
    let store = Arc::new(FileStatusStore::new(Arc::new(RealFileSystem), &state_file));

    let specs = vec![
        JobSpec::remote(
            "wipe",
            json!({
                "cmd": "echo '::start disks.yml'; echo wiping; echo '::stop disks.yml'",
                "playbook": "wipe.yml",
            }),
        ),
        JobSpec::remote("site", json!({ "cmd": "echo deploying", "playbook": "site.yml" })),
    ];
    let steps = vec![
        Step::all_of("Wipe", ["wipe.yml", "disks.yml"]),
        Step::all_of("Deploy", ["site.yml"]),
    ];

    let sequencer = JobSequencer::new(
        Arc::clone(&backend),
        store.clone(),
        Arc::new(PolicyConfirmer(Decision::Abort)),
        test_options(),
    );
    let run = sequencer.run(specs, steps, GlobalStatus::new()).unwrap();
    let (events, outcome) = drain(run).await;

    assert_eq!(final_status(&events), (JobState::Complete, None));
    assert_eq!(log_chunks(&events), vec!["wiping", "deploying"]);
    assert!(outcome.steps.iter().all(|s| s.status == JobState::Complete));

    // The ledger on disk matches and a second run has nothing to do.
    let persisted = store.load().unwrap();
    assert_eq!(persisted, outcome.ledger);
    assert!(state_file.exists());

    let run = sequencer
        .run(
            vec![
                JobSpec::remote("wipe", json!({ "cmd": "false" })),
                JobSpec::remote("site", json!({ "cmd": "false" })),
            ],
            Vec::new(),
            persisted,
        )
        .unwrap();
    let (events, outcome) = drain(run).await;
    assert_eq!(outcome.status, JobState::Complete);
    assert!(!events
        .iter()
        .any(|e| matches!(e, jobtrain::engine::SequenceEvent::JobLaunched { .. })));
}

#[tokio::test]
async fn sequence_stops_at_failing_shell_job() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend: Arc<dyn ExecutionBackend> = Arc::new(backend_in(dir.path()));
    let store = Arc::new(FileStatusStore::new(
        Arc::new(RealFileSystem),
        dir.path().join("status.json"),
    ));

    let sequencer = JobSequencer::new(
        backend,
        store,
        Arc::new(PolicyConfirmer(Decision::Abort)),
        test_options(),
    );
    let specs = vec![
        JobSpec::remote("site", json!({ "cmd": "echo '::error ceph.yml osd timeout'; sleep 0" })),
        JobSpec::remote("verify", json!({ "cmd": "true" })),
    ];
    let run = sequencer.run(specs, Vec::new(), GlobalStatus::new()).unwrap();
    let (events, outcome) = drain(run).await;

    assert_eq!(final_status(&events), (JobState::Failed, Some(FailureKind::Terminal)));
    assert_eq!(outcome.error.unwrap().message, "osd timeout");
    assert_eq!(outcome.ledger.state_of("verify"), JobState::NotStarted);

    let errors: Vec<&EventRecord> = events
        .iter()
        .filter_map(|e| match e {
            jobtrain::engine::SequenceEvent::Event { record, .. } if record.kind == EventKind::Error => {
                Some(record)
            }
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event_name, "ceph.yml");
}
