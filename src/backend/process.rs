// src/backend/process.rs

//! Local-process execution backend.
//!
//! Each submission runs `payload.cmd` through the shell and gets a UUID
//! correlation id plus a directory `<work_dir>/<id>/` holding:
//!
//! - `record.json`: the [`JobRecord`] (poll channel),
//! - `log.txt`: plain output lines,
//! - `events.jsonl`: one [`EventRecord`] per line, non-log events only.
//!
//! Live events are fanned out over a broadcast channel. A subscriber first
//! receives the job's full push history, then live events, so a late
//! subscriber never misses anything. A subscriber that falls behind the
//! fan-out has its stream closed without a terminal item.
//!
//! A directory whose record has no `end_time` and that this process is not
//! running was left behind by a previous process and is reported as killed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::runner::{self, RunRequest, RunnerOutput};
use crate::backend::{
    EventMarkers, ExecutionBackend, JobRecord, PushEvent, Submission, Subscription,
};
use crate::job::{EventKind, EventRecord};

const RECORD_FILE: &str = "record.json";
const LOG_FILE: &str = "log.txt";
const EVENTS_FILE: &str = "events.jsonl";

const BROADCAST_CAPACITY: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ProcessBackendOptions {
    pub work_dir: PathBuf,
    pub markers: EventMarkers,
}

impl Default for ProcessBackendOptions {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".jobtrain/jobs"),
            markers: EventMarkers::default(),
        }
    }
}

/// A job this process is currently running.
struct ActiveJob {
    cancel: Option<oneshot::Sender<()>>,
    history: Vec<PushEvent>,
    tx: broadcast::Sender<PushEvent>,
}

type ActiveJobs = Arc<Mutex<HashMap<String, ActiveJob>>>;

#[derive(Clone)]
pub struct ProcessBackend {
    options: ProcessBackendOptions,
    active: ActiveJobs,
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("work_dir", &self.options.work_dir)
            .finish_non_exhaustive()
    }
}

impl ProcessBackend {
    pub fn new(options: ProcessBackendOptions) -> Self {
        Self {
            options,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.options.work_dir
    }

    fn job_dir(&self, id: &str) -> PathBuf {
        self.options.work_dir.join(id)
    }

    async fn read_record(&self, id: &str) -> anyhow::Result<JobRecord> {
        let path = self.job_dir(id).join(RECORD_FILE);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("unknown job id '{id}' ({})", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn is_active(&self, id: &str) -> bool {
        match self.active.lock() {
            Ok(active) => active.contains_key(id),
            Err(_) => {
                warn!(id = %id, "active job map mutex poisoned");
                false
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn submit(&self, name: &str, payload: &Value) -> anyhow::Result<Submission> {
        let cmd = payload
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("payload for job '{name}' has no string field `cmd`"))?
            .to_string();
        let playbook = payload
            .get("playbook")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();

        let id = Uuid::new_v4().to_string();
        let dir = self.job_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating job directory {}", dir.display()))?;
        write_record(&dir, &JobRecord::default()).await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| anyhow!("active job map mutex poisoned"))?;
            active.insert(
                id.clone(),
                ActiveJob {
                    cancel: Some(cancel_tx),
                    history: Vec::new(),
                    tx,
                },
            );
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let req = RunRequest {
            job: name.to_string(),
            id: id.clone(),
            playbook: playbook.clone(),
            cmd,
        };
        tokio::spawn(runner::run_job(
            req,
            self.options.markers.clone(),
            out_tx,
            cancel_rx,
        ));
        tokio::spawn(pump(
            id.clone(),
            playbook,
            dir,
            out_rx,
            Arc::clone(&self.active),
        ));

        info!(job = %name, id = %id, "job submitted");
        Ok(Submission::Started(id))
    }

    async fn fetch_job_record(&self, id: &str) -> anyhow::Result<JobRecord> {
        // The pump writes the final record before it drops the active entry,
        // so checking liveness first never mistakes a finished job for an
        // orphan.
        let active = self.is_active(id);
        let mut record = self.read_record(id).await?;
        if !record.is_terminal() && !active {
            debug!(id = %id, "record without end_time and no live process; reporting killed");
            record.killed = true;
        }
        Ok(record)
    }

    async fn fetch_log(&self, id: &str) -> anyhow::Result<String> {
        let path = self.job_dir(id).join(LOG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn fetch_events(&self, id: &str) -> anyhow::Result<Vec<EventRecord>> {
        read_events(&self.job_dir(id)).await
    }

    async fn cancel(&self, id: &str) -> anyhow::Result<()> {
        let cancel = {
            let mut active = self
                .active
                .lock()
                .map_err(|_| anyhow!("active job map mutex poisoned"))?;
            active.get_mut(id).and_then(|job| job.cancel.take())
        };

        match cancel {
            Some(tx) => {
                info!(id = %id, "cancelling job");
                let _ = tx.send(());
            }
            None => {
                // Already finished, already cancelled or orphaned.
                let record = self.read_record(id).await?;
                debug!(id = %id, terminal = record.is_terminal(), "cancel: no live process");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, id: &str) -> anyhow::Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (unsub_tx, unsub_rx) = oneshot::channel();

        let live = {
            let active = self
                .active
                .lock()
                .map_err(|_| anyhow!("active job map mutex poisoned"))?;
            active
                .get(id)
                .map(|job| (job.history.clone(), job.tx.subscribe()))
        };

        match live {
            Some((history, brx)) => {
                tokio::spawn(forward(id.to_string(), history, brx, tx, unsub_rx));
            }
            None => {
                // Not running here: replay what is on disk and end.
                let record = self.fetch_job_record(id).await?;
                let events = self.fetch_events(id).await?;
                let id_owned = id.to_string();
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(PushEvent::Event(event)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx
                        .send(PushEvent::End {
                            code: record.code,
                            killed: record.killed,
                        })
                        .await;
                    debug!(id = %id_owned, "replayed finished job");
                    drop(unsub_rx);
                });
            }
        }

        Ok(Subscription::new(id, rx, Some(unsub_tx)))
    }
}

/// Drain runner output into the job directory and the push fan-out.
async fn pump(
    id: String,
    playbook: String,
    dir: PathBuf,
    mut out_rx: mpsc::UnboundedReceiver<RunnerOutput>,
    active: ActiveJobs,
) {
    let mut log_file = open_append(&dir.join(LOG_FILE)).await;
    let mut events_file = open_append(&dir.join(EVENTS_FILE)).await;

    while let Some(output) = out_rx.recv().await {
        match output {
            RunnerOutput::Log(line) => {
                if let Some(file) = log_file.as_mut() {
                    append_line(file, &line, &id, LOG_FILE).await;
                }
                emit(&active, &id, PushEvent::Event(EventRecord::log(&playbook, line)));
            }
            RunnerOutput::Event(event) => {
                if let Some(file) = events_file.as_mut() {
                    match serde_json::to_string(&event) {
                        Ok(json) => append_line(file, &json, &id, EVENTS_FILE).await,
                        Err(e) => warn!(id = %id, error = %e, "failed to encode event"),
                    }
                }
                emit(&active, &id, PushEvent::Event(event));
            }
            RunnerOutput::Exit { code, killed } => {
                let record = JobRecord {
                    end_time: Some(Utc::now()),
                    code,
                    killed,
                };
                if let Err(e) = write_record(&dir, &record).await {
                    warn!(id = %id, error = %e, "failed to write final job record");
                }
                emit(&active, &id, PushEvent::End { code, killed });
                break;
            }
        }
    }

    if let Ok(mut active) = active.lock() {
        active.remove(&id);
    }
    debug!(id = %id, "job pump finished");
}

/// Append to history and broadcast under one lock so a concurrent
/// `subscribe` sees every event exactly once.
fn emit(active: &ActiveJobs, id: &str, event: PushEvent) {
    match active.lock() {
        Ok(mut active) => {
            if let Some(job) = active.get_mut(id) {
                job.history.push(event.clone());
                // No receivers is fine.
                let _ = job.tx.send(event);
            }
        }
        Err(_) => warn!(id = %id, "active job map mutex poisoned; dropping event"),
    }
}

async fn forward(
    id: String,
    history: Vec<PushEvent>,
    mut brx: broadcast::Receiver<PushEvent>,
    tx: mpsc::Sender<PushEvent>,
    mut unsub_rx: oneshot::Receiver<()>,
) {
    for event in history {
        let end = matches!(event, PushEvent::End { .. });
        if tx.send(event).await.is_err() || end {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = &mut unsub_rx => {
                debug!(id = %id, "subscriber closed");
                return;
            }
            msg = brx.recv() => match msg {
                Ok(event) => {
                    let end = matches!(event, PushEvent::End { .. });
                    if tx.send(event).await.is_err() || end {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // End without a terminal item; the subscriber catches up
                    // from disk.
                    warn!(id = %id, skipped = n, "subscriber lagged; closing push stream");
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

async fn write_record(dir: &Path, record: &JobRecord) -> anyhow::Result<()> {
    let path = dir.join(RECORD_FILE);
    let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

async fn read_events(dir: &Path) -> anyhow::Result<Vec<EventRecord>> {
    let path = dir.join(EVENTS_FILE);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !dir.join(RECORD_FILE).exists() {
                bail!("unknown job directory {}", dir.display());
            }
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let mut events = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: EventRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        if event.kind != EventKind::Log {
            events.push(event);
        }
    }
    Ok(events)
}

async fn open_append(path: &Path) -> Option<tokio::fs::File> {
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = ?path, error = %e, "cannot open job output file; output will not be kept");
            None
        }
    }
}

async fn append_line(file: &mut tokio::fs::File, line: &str, id: &str, what: &str) {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    if let Err(e) = file.write_all(&buf).await {
        warn!(id = %id, file = what, error = %e, "failed to append job output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn orphaned_record_is_reported_killed() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("old-id");
        std::fs::create_dir_all(&job_dir).unwrap();
        std::fs::write(job_dir.join(RECORD_FILE), "{}").unwrap();
        std::fs::write(
            job_dir.join(EVENTS_FILE),
            "{\"event_name\":\"site.yml\",\"type\":\"start\"}\n",
        )
        .unwrap();

        let backend = ProcessBackend::new(ProcessBackendOptions {
            work_dir: dir.path().to_path_buf(),
            markers: EventMarkers::default(),
        });

        let record = backend.fetch_job_record("old-id").await.unwrap();
        assert!(record.killed);
        assert_eq!(
            backend.fetch_events("old-id").await.unwrap(),
            vec![EventRecord::start("site.yml")]
        );

        let mut sub = backend.subscribe("old-id").await.unwrap();
        assert_eq!(
            sub.next_event().await,
            Some(PushEvent::Event(EventRecord::start("site.yml")))
        );
        assert_eq!(sub.next_event().await, Some(PushEvent::killed()));
        assert_eq!(sub.next_event().await, None);
    }

    #[tokio::test]
    async fn finishing_job_is_never_reported_killed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessBackendOptions {
            work_dir: dir.path().to_path_buf(),
            markers: EventMarkers::default(),
        });

        for _ in 0..10 {
            let id = match backend
                .submit("quick", &serde_json::json!({ "cmd": "exit 0" }))
                .await
                .unwrap()
            {
                Submission::Started(id) => id,
                other => panic!("unexpected submission {other:?}"),
            };

            let record = tokio::time::timeout(std::time::Duration::from_secs(5), async {
                loop {
                    let record = backend.fetch_job_record(&id).await.unwrap();
                    assert!(!record.killed, "job {id} reported killed while finishing");
                    if record.is_terminal() {
                        return record;
                    }
                    tokio::task::yield_now().await;
                }
            })
            .await
            .unwrap();
            assert_eq!(record.code, Some(0));
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_stream_ends_without_terminal() {
        let (btx, brx) = broadcast::channel(2);
        for i in 0..5 {
            btx.send(PushEvent::Event(EventRecord::log("site.yml", format!("line {i}"))))
                .unwrap();
        }
        btx.send(PushEvent::end(0)).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (_unsub_tx, unsub_rx) = oneshot::channel();
        forward("lagged".to_string(), Vec::new(), brx, tx, unsub_rx).await;

        let mut forwarded = Vec::new();
        while let Some(event) = rx.recv().await {
            forwarded.push(event);
        }
        assert!(forwarded.is_empty(), "{forwarded:?}");
        drop(btx);
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessBackendOptions {
            work_dir: dir.path().to_path_buf(),
            markers: EventMarkers::default(),
        });
        assert!(backend.fetch_job_record("nope").await.is_err());
        assert!(backend.fetch_events("nope").await.is_err());
        assert!(backend.subscribe("nope").await.is_err());
    }

    #[tokio::test]
    async fn payload_without_cmd_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessBackendOptions {
            work_dir: dir.path().to_path_buf(),
            markers: EventMarkers::default(),
        });
        let err = backend
            .submit("wipe", &serde_json::json!({"playbook": "wipe.yml"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cmd"));
    }
}
