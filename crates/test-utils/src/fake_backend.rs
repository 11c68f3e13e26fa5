use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use jobtrain::backend::{
    ExecutionBackend, JobRecord, PartialFailure, PushEvent, Submission, Subscription,
};
use jobtrain::job::{EventKind, EventRecord};

/// What the fake does when a job with a given name is submitted.
#[derive(Debug, Clone)]
pub enum JobScript {
    /// Accepted; the events are reported, then a successful end.
    Succeeds(Vec<EventRecord>),
    /// Accepted; the events are reported, then an end with this exit code.
    Fails(Vec<EventRecord>, i32),
    /// Accepted; the events are reported and the job runs until cancelled
    /// or ended by hand with [`FakeBackend::push`].
    Hangs(Vec<EventRecord>),
    /// Submission rejected with this message.
    Rejected(String),
    /// Batch call with mixed results.
    Partial(PartialFailure),
}

impl JobScript {
    pub fn succeeds<I: IntoIterator<Item = EventRecord>>(events: I) -> Self {
        JobScript::Succeeds(events.into_iter().collect())
    }

    pub fn fails<I: IntoIterator<Item = EventRecord>>(events: I, code: i32) -> Self {
        JobScript::Fails(events.into_iter().collect(), code)
    }

    pub fn hangs<I: IntoIterator<Item = EventRecord>>(events: I) -> Self {
        JobScript::Hangs(events.into_iter().collect())
    }

    pub fn rejected(message: &str) -> Self {
        JobScript::Rejected(message.to_string())
    }

    pub fn partial(message: &str, follow_up: Option<&str>) -> Self {
        JobScript::Partial(PartialFailure {
            message: message.to_string(),
            succeeded: vec!["node1".to_string()],
            failed: vec!["node2".to_string()],
            follow_up: follow_up.map(str::to_string),
        })
    }
}

#[derive(Default)]
struct FakeJob {
    record: JobRecord,
    events: Vec<EventRecord>,
    log: Vec<String>,
    history: Vec<PushEvent>,
    live: Vec<mpsc::Sender<PushEvent>>,
}

impl FakeJob {
    fn push(&mut self, event: PushEvent) {
        match &event {
            PushEvent::Event(record) if record.kind == EventKind::Log => {
                self.log.push(record.text().unwrap_or_default().to_string());
            }
            PushEvent::Event(record) => self.events.push(record.clone()),
            PushEvent::End { code, killed } => {
                self.record = JobRecord {
                    end_time: Some(Utc::now()),
                    code: *code,
                    killed: *killed,
                };
            }
        }
        self.history.push(event.clone());
        self.live.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn ended(&self) -> bool {
        self.record.is_terminal()
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, JobScript>,
    jobs: HashMap<String, FakeJob>,
    submitted: Vec<String>,
    calls: Vec<String>,
    cancelled: Vec<String>,
    /// Remaining injected failures per call name.
    faults: HashMap<String, usize>,
    next_id: u64,
}

/// Scripted in-memory [`ExecutionBackend`].
///
/// Ids are `"1"`, `"2"`, ... in submission order. Every channel reports a
/// job from its beginning: a subscription first replays the job's history.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, job: &str, script: JobScript) -> &Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(job.to_string(), script);
        self
    }

    /// Register a job that was launched before the test started (e.g. by a
    /// previous process). `end` is the exit code if it already finished.
    pub fn seed_job(&self, id: &str, events: Vec<EventRecord>, log: &[&str], end: Option<i32>) {
        let mut job = FakeJob::default();
        for line in log {
            job.push(PushEvent::Event(EventRecord::log(id, *line)));
        }
        for event in events {
            job.push(PushEvent::Event(event));
        }
        if let Some(code) = end {
            job.push(PushEvent::end(code));
        }
        self.state.lock().unwrap().jobs.insert(id.to_string(), job);
    }

    /// Report one more item for job `id`.
    pub fn push(&self, id: &str, event: PushEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .get_mut(id)
            .unwrap_or_else(|| panic!("unknown fake job {id}"))
            .push(event);
    }

    /// Close every open push stream of `id` without a terminal signal.
    pub fn drop_subscribers(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(id) {
            job.live.clear();
        }
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .get_mut(id)
            .map(|job| {
                job.live.retain(|tx| !tx.is_closed());
                job.live.len()
            })
            .unwrap_or(0)
    }

    /// Job names passed to `submit`, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Every backend call as `"<call>:<arg>"`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    /// Make the next `times` calls named `call` (e.g. `"fetch_events"`)
    /// fail. The calls are still recorded.
    pub fn fail_calls(&self, call: &str, times: usize) -> &Self {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(call.to_string(), times);
        self
    }

    /// Record a call and apply any injected failure for it.
    fn record_call(state: &mut State, call: &str, arg: &str) -> anyhow::Result<()> {
        state.calls.push(format!("{call}:{arg}"));
        match state.faults.get_mut(call) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                anyhow::bail!("injected {call} failure for {arg}")
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn submit(&self, name: &str, _payload: &Value) -> anyhow::Result<Submission> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "submit", name)?;
        state.submitted.push(name.to_string());

        let script = state
            .scripts
            .get(name)
            .cloned()
            .unwrap_or_else(|| JobScript::Succeeds(Vec::new()));

        let (events, end) = match script {
            JobScript::Rejected(message) => anyhow::bail!(message),
            JobScript::Partial(partial) => return Ok(Submission::Partial(partial)),
            JobScript::Succeeds(events) => (events, Some(0)),
            JobScript::Fails(events, code) => (events, Some(code)),
            JobScript::Hangs(events) => (events, None),
        };

        state.next_id += 1;
        let id = state.next_id.to_string();
        let mut job = FakeJob::default();
        for event in events {
            job.push(PushEvent::Event(event));
        }
        if let Some(code) = end {
            job.push(PushEvent::end(code));
        }
        state.jobs.insert(id.clone(), job);

        Ok(Submission::Started(id))
    }

    async fn fetch_job_record(&self, id: &str) -> anyhow::Result<JobRecord> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "fetch_job_record", id)?;
        state
            .jobs
            .get(id)
            .map(|job| job.record.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown job id {id}"))
    }

    async fn fetch_log(&self, id: &str) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "fetch_log", id)?;
        state
            .jobs
            .get(id)
            .map(|job| job.log.join("\n"))
            .ok_or_else(|| anyhow::anyhow!("unknown job id {id}"))
    }

    async fn fetch_events(&self, id: &str) -> anyhow::Result<Vec<EventRecord>> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "fetch_events", id)?;
        state
            .jobs
            .get(id)
            .map(|job| job.events.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown job id {id}"))
    }

    async fn cancel(&self, id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "cancel", id)?;
        state.cancelled.push(id.to_string());
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown job id {id}"))?;
        if !job.ended() {
            job.push(PushEvent::killed());
        }
        Ok(())
    }

    async fn subscribe(&self, id: &str) -> anyhow::Result<Subscription> {
        let mut state = self.state.lock().unwrap();
        Self::record_call(&mut state, "subscribe", id)?;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown job id {id}"))?;

        let (tx, rx) = mpsc::channel(1024);
        for event in &job.history {
            let _ = tx.try_send(event.clone());
        }
        if !job.ended() {
            job.live.push(tx);
        }
        Ok(Subscription::new(id, rx, None))
    }
}
