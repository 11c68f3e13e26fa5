// src/engine/monitor.rs

//! Event monitor: follow one job until its own terminal signal.
//!
//! Two channels feed a [`JobWatch`]:
//!
//! - push: a [`Subscription`] opened right after a fresh launch;
//! - poll: `fetch_job_record`, then `fetch_log` / `fetch_events` for
//!   catch-up. Used first when reattaching after a reload (the old push
//!   subscription died with the old process), and again whenever a push
//!   stream ends without a terminal signal.
//!
//! Every channel reports a job from its beginning, so after switching
//! channels the watch skips as many events and log lines as it already
//! delivered. Duplicate Start events are collapsed. An `Error` event ends
//! the job as failed. A failed catch-up read is skipped; the job record
//! alone settles whether the job is over. Other backend errors while
//! monitoring are logged and retried after `reconnect_delay`; they never
//! fail the job, and nothing is ever resubmitted.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{ExecutionBackend, JobOutcome, PushEvent, Subscription};
use crate::job::{EventKind, EventRecord};

/// One item produced by [`JobWatch::next`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchItem {
    Event(EventRecord),
    Log(String),
    /// Always the last item.
    Terminal(JobOutcome),
}

#[derive(Clone)]
pub struct EventMonitor {
    backend: Arc<dyn ExecutionBackend>,
    reconnect_delay: Duration,
}

impl EventMonitor {
    pub fn new(backend: Arc<dyn ExecutionBackend>, reconnect_delay: Duration) -> Self {
        Self {
            backend,
            reconnect_delay,
        }
    }

    /// Follow a job that was just submitted, over its push subscription.
    pub fn watch_fresh(&self, id: impl Into<String>, sub: Subscription) -> JobWatch {
        JobWatch::new(self, id.into(), Source::Push(sub), true)
    }

    /// Follow a job launched by an earlier process: poll first.
    pub fn reattach(&self, id: impl Into<String>) -> JobWatch {
        JobWatch::new(self, id.into(), Source::Poll, true)
    }

    /// Follow a local action. There is nothing to poll: a stream that ends
    /// without a terminal signal is a failure.
    pub fn watch_local(&self, sub: Subscription) -> JobWatch {
        let id = sub.id().to_string();
        JobWatch::new(self, id, Source::Push(sub), false)
    }
}

enum Source {
    Push(Subscription),
    Poll,
    Closed,
}

pub struct JobWatch {
    backend: Arc<dyn ExecutionBackend>,
    reconnect_delay: Duration,
    id: String,
    source: Source,
    pollable: bool,
    queue: VecDeque<WatchItem>,
    started: HashSet<String>,
    events_seen: usize,
    logs_seen: usize,
    skip_events: usize,
    skip_logs: usize,
    done: bool,
}

impl std::fmt::Debug for JobWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWatch")
            .field("id", &self.id)
            .field("events_seen", &self.events_seen)
            .field("logs_seen", &self.logs_seen)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl JobWatch {
    fn new(monitor: &EventMonitor, id: String, source: Source, pollable: bool) -> Self {
        Self {
            backend: Arc::clone(&monitor.backend),
            reconnect_delay: monitor.reconnect_delay,
            id,
            source,
            pollable,
            queue: VecDeque::new(),
            started: HashSet::new(),
            events_seen: 0,
            logs_seen: 0,
            skip_events: 0,
            skip_logs: 0,
            done: false,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.id
    }

    /// Next item in arrival order; `None` once the terminal item was
    /// returned.
    pub async fn next(&mut self) -> Option<WatchItem> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.done {
                self.close();
                return None;
            }

            match &mut self.source {
                Source::Push(sub) => match sub.next_event().await {
                    Some(PushEvent::Event(record)) => self.ingest(record),
                    Some(PushEvent::End { code, killed }) => {
                        self.finish(JobOutcome::from_exit(code, killed));
                    }
                    None if self.pollable => {
                        warn!(
                            id = %self.id,
                            delay = ?self.reconnect_delay,
                            "push stream ended without a terminal signal; falling back to polling"
                        );
                        self.source = Source::Poll;
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                    None => {
                        self.finish(JobOutcome::Failed(
                            "event stream ended without a result".to_string(),
                        ));
                    }
                },
                Source::Poll => self.poll().await,
                Source::Closed => {
                    self.finish(JobOutcome::Failed("monitoring was closed".to_string()));
                }
            }
        }
    }

    /// Stop listening. Does not touch the job itself.
    pub fn close(&mut self) {
        if let Source::Push(sub) = &mut self.source {
            sub.close();
        }
        self.source = Source::Closed;
    }

    /// One pass of the poll channel: record, catch-up, then either the
    /// terminal outcome or a fresh push subscription.
    async fn poll(&mut self) {
        let record = match self.backend.fetch_job_record(&self.id).await {
            Ok(record) => record,
            Err(err) => {
                self.monitor_failure("fetch_job_record", &err).await;
                return;
            }
        };

        // The catch-up reads the job from its start.
        self.skip_events = self.events_seen;
        self.skip_logs = self.logs_seen;

        match self.backend.fetch_log(&self.id).await {
            Ok(log) => {
                for line in log.lines() {
                    self.ingest(EventRecord::log(self.id.clone(), line));
                }
            }
            Err(err) => warn!(id = %self.id, error = %err, "log catch-up failed; continuing"),
        }

        match self.backend.fetch_events(&self.id).await {
            Ok(events) => {
                debug!(id = %self.id, count = events.len(), "catching up on events");
                for record in events {
                    self.ingest(record);
                }
            }
            // The record below still decides whether the job is over.
            Err(err) => warn!(id = %self.id, error = %err, "event catch-up failed; continuing"),
        }

        if self.done {
            return;
        }

        if let Some(outcome) = record.outcome() {
            info!(id = %self.id, ?outcome, "job already finished");
            self.finish(outcome);
            return;
        }

        match self.backend.subscribe(&self.id).await {
            Ok(sub) => {
                debug!(id = %self.id, "subscribed after catch-up");
                self.skip_events = self.events_seen;
                self.skip_logs = self.logs_seen;
                self.source = Source::Push(sub);
            }
            Err(err) => self.monitor_failure("subscribe", &err).await,
        }
    }

    async fn monitor_failure(&self, call: &str, err: &anyhow::Error) {
        warn!(
            id = %self.id,
            call,
            error = %err,
            delay = ?self.reconnect_delay,
            "monitoring call failed; retrying"
        );
        tokio::time::sleep(self.reconnect_delay).await;
    }

    fn ingest(&mut self, record: EventRecord) {
        if self.done {
            return;
        }

        if record.kind == EventKind::Log {
            if self.skip_logs > 0 {
                self.skip_logs -= 1;
                return;
            }
            self.logs_seen += 1;
            let text = record.text().unwrap_or_default().to_string();
            self.queue.push_back(WatchItem::Log(text));
            return;
        }

        if self.skip_events > 0 {
            self.skip_events -= 1;
            return;
        }
        self.events_seen += 1;

        match record.kind {
            EventKind::Start => {
                if !self.started.insert(record.event_name.clone()) {
                    debug!(id = %self.id, event = %record.event_name, "duplicate start ignored");
                    return;
                }
                self.queue.push_back(WatchItem::Event(record));
            }
            EventKind::Error => {
                let message = record
                    .text()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} reported an error", record.event_name));
                self.queue.push_back(WatchItem::Event(record));
                self.finish(JobOutcome::Failed(message));
            }
            _ => self.queue.push_back(WatchItem::Event(record)),
        }
    }

    fn finish(&mut self, outcome: JobOutcome) {
        if self.done {
            return;
        }
        self.done = true;
        self.queue.push_back(WatchItem::Terminal(outcome));
    }
}
