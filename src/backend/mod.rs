// src/backend/mod.rs

//! Execution backend boundary.
//!
//! The engine talks to an [`ExecutionBackend`] instead of a concrete job
//! runner. This makes it easy to swap in a scripted fake in tests while
//! keeping the production implementation in [`process`].
//!
//! - [`process::ProcessBackend`] runs each remote job as a shell command,
//!   keeps a per-job record/log/event directory for the poll channel and
//!   fans live events out for the push channel.
//! - [`Subscription`] is the typed push stream handed out by
//!   [`ExecutionBackend::subscribe`]; closing or dropping it unsubscribes.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::job::{CorrelationId, EventRecord};

pub mod markers;
pub mod process;
pub mod runner;

pub use markers::EventMarkers;
pub use process::{ProcessBackend, ProcessBackendOptions};

/// Terminal outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Complete,
    Failed(String),
}

impl JobOutcome {
    /// Outcome from an exit code / kill flag pair.
    pub fn from_exit(code: Option<i32>, killed: bool) -> Self {
        if killed {
            return JobOutcome::Failed("job was killed".to_string());
        }
        match code {
            Some(0) => JobOutcome::Complete,
            Some(code) => JobOutcome::Failed(format!("job exited with code {code}")),
            None => JobOutcome::Failed("job ended without an exit code".to_string()),
        }
    }
}

/// Backend job record returned by the poll channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default)]
    pub killed: bool,
}

impl JobRecord {
    /// `end_time` present or `killed`.
    pub fn is_terminal(&self) -> bool {
        self.end_time.is_some() || self.killed
    }

    /// `None` while the job is still running.
    pub fn outcome(&self) -> Option<JobOutcome> {
        if self.is_terminal() {
            Some(JobOutcome::from_exit(self.code, self.killed))
        } else {
            None
        }
    }
}

/// One item on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Event(EventRecord),
    /// The job's own terminal signal.
    End { code: Option<i32>, killed: bool },
}

impl PushEvent {
    pub fn end(code: i32) -> Self {
        PushEvent::End {
            code: Some(code),
            killed: false,
        }
    }

    pub fn killed() -> Self {
        PushEvent::End {
            code: None,
            killed: true,
        }
    }
}

/// Mixed result of a batch-style submission: some targets succeeded, some
/// failed. Distinct from a rejected submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    pub message: String,
    #[serde(default)]
    pub succeeded: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    /// Asynchronous sub-process spawned by the call (e.g. a migration) whose
    /// own terminal signal decides the job if the operator continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<CorrelationId>,
}

/// Successful answer of [`ExecutionBackend::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Started(CorrelationId),
    Partial(PartialFailure),
}

/// Live push subscription keyed by correlation id.
///
/// Implements [`Stream`]; the stream ends when the backend drops its side.
/// [`Subscription::close`] (also run on drop) tells the backend to stop
/// forwarding.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<PushEvent>,
    unsubscribe: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        rx: mpsc::Receiver<PushEvent>,
        unsubscribe: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            id: id.into(),
            rx,
            unsubscribe,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next_event(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.unsubscribe.take() {
            let _ = tx.send(());
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for Subscription {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Boundary calls the engine consumes from the execution backend. Wire
/// formats are owned by the implementation.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, name: &str, payload: &Value) -> anyhow::Result<Submission>;

    async fn fetch_job_record(&self, id: &str) -> anyhow::Result<JobRecord>;

    async fn fetch_log(&self, id: &str) -> anyhow::Result<String>;

    /// Non-log events recorded so far, in order.
    async fn fetch_events(&self, id: &str) -> anyhow::Result<Vec<EventRecord>>;

    async fn cancel(&self, id: &str) -> anyhow::Result<()>;

    async fn subscribe(&self, id: &str) -> anyhow::Result<Subscription>;
}
