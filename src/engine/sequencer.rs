// src/engine/sequencer.rs

//! Async shell that runs a job sequence.
//!
//! [`JobSequencer::run`] spawns one driver task. The driver executes the
//! resume plan from [`core`](super::core) one job at a time, feeds each
//! job's events into the aggregator and writes every ledger transition to
//! the [`StatusStore`]. Everything the caller needs to render progress comes
//! out of the returned [`SequenceRun`] stream.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, JobOutcome, PartialFailure, Submission};
use crate::engine::aggregator::{ProgressAggregator, StepView};
use crate::engine::arbiter::{confirmation_message, Arbitration, Confirmer, FailureArbiter};
use crate::engine::core::{plan_from, plan_resume, ResumePoint};
use crate::engine::launcher::RemoteJobLauncher;
use crate::engine::local::LocalActionAdapter;
use crate::engine::log_buffer::{LogBuffer, LogFlusher, LogSink};
use crate::engine::monitor::{EventMonitor, JobWatch, WatchItem};
use crate::engine::{EngineOptions, FailureKind, SequenceError, SequenceEvent};
use crate::errors::{JobtrainError, Result};
use crate::job::{CorrelationId, GlobalStatus, JobKind, JobSpec, Step, TransitionError};
use crate::store::StatusStore;
use crate::types::JobState;

const EVENT_BUFFER: usize = 256;
const CONTROL_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Cancel,
}

/// Final result of a sequence run.
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    pub status: JobState,
    pub error: Option<SequenceError>,
    pub ledger: GlobalStatus,
    pub steps: Vec<StepView>,
    pub log: LogBuffer,
}

/// Cloneable handle that cancels the in-progress job of a run.
#[derive(Debug, Clone)]
pub struct CancelHandle(mpsc::Sender<Control>);

impl CancelHandle {
    pub fn cancel(&self) {
        if self.0.try_send(Control::Cancel).is_err() {
            debug!("sequence already finished or cancel already pending");
        }
    }
}

/// A running sequence: a stream of [`SequenceEvent`]s plus control.
#[derive(Debug)]
pub struct SequenceRun {
    events: ReceiverStream<SequenceEvent>,
    control: mpsc::Sender<Control>,
    handle: JoinHandle<SequenceOutcome>,
}

impl SequenceRun {
    pub async fn next_event(&mut self) -> Option<SequenceEvent> {
        self.events.next().await
    }

    /// Cancel the in-progress job. It is marked failed and nothing after it
    /// is launched. Completed jobs are not rolled back.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.control.clone())
    }

    /// Wait for the driver to finish. Events not consumed yet are dropped.
    pub async fn wait(self) -> Result<SequenceOutcome> {
        let SequenceRun {
            events,
            control,
            handle,
        } = self;
        drop(events);
        let outcome = handle.await.map_err(JobtrainError::Join)?;
        drop(control);
        Ok(outcome)
    }
}

impl Stream for SequenceRun {
    type Item = SequenceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Orders and launches jobs strictly one at a time.
#[derive(Clone)]
pub struct JobSequencer {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn StatusStore>,
    confirmer: Arc<dyn Confirmer>,
    options: EngineOptions,
}

impl JobSequencer {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn StatusStore>,
        confirmer: Arc<dyn Confirmer>,
        options: EngineOptions,
    ) -> Self {
        Self {
            backend,
            store,
            confirmer,
            options,
        }
    }

    /// Start driving `specs` from wherever `prior` says the last attempt
    /// stopped.
    pub fn run(&self, specs: Vec<JobSpec>, steps: Vec<Step>, prior: GlobalStatus) -> Result<SequenceRun> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(JobtrainError::ConfigError(format!(
                    "duplicate job name '{}' in sequence",
                    spec.name
                )));
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);

        let flusher = LogFlusher::spawn(self.options.log_flush_interval, events_tx.clone());
        let driver = Driver {
            monitor: EventMonitor::new(Arc::clone(&self.backend), self.options.reconnect_delay),
            launcher: RemoteJobLauncher::new(Arc::clone(&self.backend)),
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            confirmer: Arc::clone(&self.confirmer),
            aggregator: ProgressAggregator::new(steps),
            specs,
            ledger: prior,
            events: events_tx,
            control: control_rx,
            control_closed: false,
            log: flusher.sink(),
            reported_in_progress: false,
        };

        let handle = tokio::spawn(driver.run(flusher));

        Ok(SequenceRun {
            events: ReceiverStream::new(events_rx),
            control: control_tx,
            handle,
        })
    }
}

enum Next {
    Item(Option<WatchItem>),
    Cancel,
}

struct Driver {
    specs: Vec<JobSpec>,
    ledger: GlobalStatus,
    aggregator: ProgressAggregator,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn StatusStore>,
    confirmer: Arc<dyn Confirmer>,
    monitor: EventMonitor,
    launcher: RemoteJobLauncher,
    events: mpsc::Sender<SequenceEvent>,
    control: mpsc::Receiver<Control>,
    control_closed: bool,
    log: LogSink,
    reported_in_progress: bool,
}

impl Driver {
    async fn run(mut self, flusher: LogFlusher) -> SequenceOutcome {
        info!(jobs = self.specs.len(), "sequence started");

        let plan = plan_resume(&self.specs, &self.ledger);
        self.restore_completed(&plan.completed).await;
        self.emit_steps().await;

        let mut point = plan.point;
        let result = loop {
            let index = match point {
                ResumePoint::Finished => break Ok(()),
                ResumePoint::Halted { index } => break Err(self.halted(index).await),
                ResumePoint::Launch(index) => {
                    if self.cancel_pending() {
                        break Err(self.cancelled_before_launch(index));
                    }
                    if let Err(err) = self.launch(index).await {
                        break Err(err);
                    }
                    index
                }
                ResumePoint::Reattach {
                    index,
                    correlation_id,
                } => {
                    if let Err(err) = self.reattach(index, correlation_id).await {
                        break Err(err);
                    }
                    index
                }
            };

            let plan = plan_from(&self.specs, &self.ledger, index + 1);
            self.restore_completed(&plan.completed).await;
            point = plan.point;
        };

        // The flusher holds a sink of its own; stopping it drains the rest.
        drop(self.log);
        let log = flusher.finish().await;

        let steps = self.aggregator.snapshot();
        let _ = self.events.send(SequenceEvent::Steps(steps.clone())).await;

        let (status, error) = match result {
            Ok(()) => {
                info!("sequence complete");
                (JobState::Complete, None)
            }
            Err(err) => {
                warn!(job = %err.job, kind = %err.kind, message = %err.message, "sequence failed");
                (JobState::Failed, Some(err))
            }
        };
        let _ = self
            .events
            .send(SequenceEvent::Status {
                status,
                error: error.clone(),
            })
            .await;

        SequenceOutcome {
            status,
            error,
            ledger: self.ledger,
            steps,
            log,
        }
    }

    async fn emit(&self, event: SequenceEvent) {
        // A consumer that stopped listening does not stop the sequence.
        let _ = self.events.send(event).await;
    }

    async fn emit_steps(&self) {
        self.emit(SequenceEvent::Steps(self.aggregator.snapshot())).await;
    }

    async fn emit_state(&self, name: &str) {
        self.emit(SequenceEvent::JobState {
            name: name.to_string(),
            state: self.ledger.state_of(name),
        })
        .await;
    }

    async fn report_in_progress(&mut self) {
        if !self.reported_in_progress {
            self.reported_in_progress = true;
            self.emit(SequenceEvent::Status {
                status: JobState::InProgress,
                error: None,
            })
            .await;
        }
    }

    /// Apply a ledger transition and persist the ledger.
    fn transition<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce(&mut GlobalStatus) -> std::result::Result<(), TransitionError>,
    {
        if let Err(err) = f(&mut self.ledger) {
            warn!(job = %name, error = %err, "ledger transition rejected");
            return;
        }
        if let Err(err) = self.store.persist(&self.ledger) {
            error!(job = %name, error = %err, "failed to persist job statuses");
        }
    }

    fn is_last(&self, index: usize) -> bool {
        index + 1 == self.specs.len()
    }

    /// Rebuild step state for jobs the ledger has as complete. Events are
    /// fetched best-effort; logs are not replayed.
    async fn restore_completed(&mut self, indices: &[usize]) {
        for &index in indices {
            let name = self.specs[index].name.clone();
            if let Some(id) = self.ledger.correlation_id_of(&name).map(str::to_string) {
                self.restore_events(&name, &id).await;
            }
            debug!(job = %name, "already complete; skipping");
            self.aggregator.job_completed(&name, self.is_last(index));
        }
    }

    async fn restore_events(&mut self, name: &str, id: &str) {
        match self.backend.fetch_events(id).await {
            Ok(events) => {
                for record in &events {
                    self.aggregator.apply(name, record);
                }
            }
            Err(err) => {
                debug!(job = %name, id = %id, error = %err, "could not restore events");
            }
        }
    }

    async fn halted(&mut self, index: usize) -> SequenceError {
        let name = self.specs[index].name.clone();
        if let Some(id) = self.ledger.correlation_id_of(&name).map(str::to_string) {
            self.restore_events(&name, &id).await;
        }
        // A remote job left in progress without an id was interrupted
        // before its partial failure was resolved.
        let interrupted = self.ledger.state_of(&name) == JobState::InProgress;
        if interrupted {
            self.transition(&name, |l| l.mark_failed(&name));
        }
        self.aggregator.job_failed(&name);
        self.emit_state(&name).await;

        let message = if interrupted {
            info!(job = %name, "job was interrupted while awaiting confirmation; halting");
            "job was interrupted before its partial failure was resolved; retry it to continue"
        } else {
            info!(job = %name, "job failed in an earlier attempt; halting");
            "job failed in an earlier attempt; retry it to continue"
        };
        SequenceError::new(name, FailureKind::Terminal, message)
    }

    async fn launch(&mut self, index: usize) -> std::result::Result<(), SequenceError> {
        let spec = self.specs[index].clone();
        let name = spec.name.as_str();

        match &spec.kind {
            JobKind::Remote { payload } => match self.launcher.launch(name, payload).await {
                Err(err) => {
                    self.fail(index).await;
                    Err(SequenceError::new(name, FailureKind::Launch, format!("{err:#}")))
                }
                Ok(Submission::Started(id)) => {
                    self.transition(name, |l| l.mark_in_progress(name, Some(id.clone())));
                    self.announce_launch(index, Some(id.clone())).await;

                    let watch = match self.backend.subscribe(&id).await {
                        Ok(sub) => self.monitor.watch_fresh(id, sub),
                        Err(err) => {
                            warn!(job = %name, id = %id, error = %err, "subscribe failed; polling instead");
                            self.monitor.reattach(id)
                        }
                    };
                    self.follow(index, watch).await
                }
                Ok(Submission::Partial(partial)) => self.arbitrate(index, partial).await,
            },
            JobKind::Local { action } => {
                self.transition(name, |l| l.mark_in_progress(name, None));
                self.announce_launch(index, None).await;

                let sub = LocalActionAdapter.start(name, action, self.log.clone());
                let watch = self.monitor.watch_local(sub);
                self.follow(index, watch).await
            }
        }
    }

    async fn announce_launch(&mut self, index: usize, correlation_id: Option<CorrelationId>) {
        let name = self.specs[index].name.clone();
        self.report_in_progress().await;
        self.emit(SequenceEvent::JobLaunched {
            index,
            name: name.clone(),
            correlation_id,
        })
        .await;
        self.emit_state(&name).await;
    }

    async fn reattach(
        &mut self,
        index: usize,
        correlation_id: CorrelationId,
    ) -> std::result::Result<(), SequenceError> {
        let name = self.specs[index].name.clone();
        info!(job = %name, id = %correlation_id, "reattaching to running job");

        self.report_in_progress().await;
        self.emit(SequenceEvent::JobReattached {
            index,
            name: name.clone(),
            correlation_id: correlation_id.clone(),
        })
        .await;
        self.emit_state(&name).await;

        let watch = self.monitor.reattach(correlation_id);
        self.follow(index, watch).await
    }

    async fn arbitrate(
        &mut self,
        index: usize,
        partial: PartialFailure,
    ) -> std::result::Result<(), SequenceError> {
        let name = self.specs[index].name.clone();
        self.transition(&name, |l| l.mark_in_progress(&name, None));
        self.announce_launch(index, None).await;

        self.emit(SequenceEvent::ConfirmationRequested {
            job: name.clone(),
            message: confirmation_message(&name, &partial),
        })
        .await;

        let confirmer = Arc::clone(&self.confirmer);
        let arbiter = FailureArbiter::new(confirmer.as_ref());
        let arbitration = tokio::select! {
            biased;
            _ = recv_control(&mut self.control, &mut self.control_closed) => None,
            arbitration = arbiter.arbitrate(&name, &partial) => Some(arbitration),
        };

        match arbitration {
            None => {
                info!(job = %name, "cancelled while waiting for confirmation");
                self.fail(index).await;
                Err(SequenceError::new(name, FailureKind::Cancelled, "cancelled by caller"))
            }
            Some(Arbitration::Abort) => {
                self.fail(index).await;
                Err(SequenceError::new(name, FailureKind::Partial, partial.message))
            }
            Some(Arbitration::SoftSuccess) => {
                info!(job = %name, "partial failure accepted");
                self.complete(index).await;
                Ok(())
            }
            Some(Arbitration::AwaitFollowUp(id)) => {
                info!(job = %name, id = %id, "partial failure accepted; waiting for follow-up");
                self.transition(&name, |l| l.set_correlation_id(&name, id.clone()));
                let watch = match self.backend.subscribe(&id).await {
                    Ok(sub) => self.monitor.watch_fresh(id, sub),
                    Err(err) => {
                        warn!(job = %name, id = %id, error = %err, "subscribe failed; polling instead");
                        self.monitor.reattach(id)
                    }
                };
                self.follow(index, watch).await
            }
        }
    }

    /// Drive one job's watch until its terminal signal or a cancel.
    async fn follow(
        &mut self,
        index: usize,
        mut watch: JobWatch,
    ) -> std::result::Result<(), SequenceError> {
        let name = self.specs[index].name.clone();

        loop {
            // A cancel wins over an item that is ready at the same time.
            let next = tokio::select! {
                biased;
                _ = recv_control(&mut self.control, &mut self.control_closed) => Next::Cancel,
                item = watch.next() => Next::Item(item),
            };

            match next {
                Next::Cancel => return Err(self.cancel_job(index, &mut watch).await),
                Next::Item(Some(WatchItem::Log(text))) => self.log.log(text),
                Next::Item(Some(WatchItem::Event(record))) => {
                    let changed = self.aggregator.apply(&name, &record);
                    self.emit(SequenceEvent::Event {
                        job: name.clone(),
                        record,
                    })
                    .await;
                    if changed {
                        self.emit_steps().await;
                    }
                }
                Next::Item(Some(WatchItem::Terminal(JobOutcome::Complete))) => {
                    self.complete(index).await;
                    return Ok(());
                }
                Next::Item(Some(WatchItem::Terminal(JobOutcome::Failed(message)))) => {
                    self.fail(index).await;
                    return Err(SequenceError::new(name, FailureKind::Terminal, message));
                }
                Next::Item(None) => {
                    self.fail(index).await;
                    return Err(SequenceError::new(
                        name,
                        FailureKind::Terminal,
                        "monitor stopped before the job finished",
                    ));
                }
            }
        }
    }

    /// Whether a cancel arrived while no job was being followed.
    fn cancel_pending(&mut self) -> bool {
        if self.control_closed {
            return false;
        }
        match self.control.try_recv() {
            Ok(Control::Cancel) => true,
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.control_closed = true;
                false
            }
        }
    }

    fn cancelled_before_launch(&self, index: usize) -> SequenceError {
        let name = self.specs[index].name.clone();
        info!(job = %name, "cancel requested; not launching");
        SequenceError::new(name, FailureKind::Cancelled, "cancelled by caller")
    }

    async fn cancel_job(&mut self, index: usize, watch: &mut JobWatch) -> SequenceError {
        let spec = &self.specs[index];
        let name = spec.name.clone();
        info!(job = %name, "cancel requested");

        if !spec.is_local() {
            let id = watch.correlation_id().to_string();
            if let Err(err) = self.backend.cancel(&id).await {
                warn!(job = %name, id = %id, error = %err, "backend cancel failed");
            }
        }
        watch.close();

        self.fail(index).await;
        SequenceError::new(name, FailureKind::Cancelled, "cancelled by caller")
    }

    async fn complete(&mut self, index: usize) {
        let name = self.specs[index].name.clone();
        self.transition(&name, |l| l.mark_complete(&name));
        self.aggregator.job_completed(&name, self.is_last(index));
        info!(job = %name, "job complete");
        self.emit_state(&name).await;
        self.emit_steps().await;
    }

    async fn fail(&mut self, index: usize) {
        let name = self.specs[index].name.clone();
        self.transition(&name, |l| l.mark_failed(&name));
        self.aggregator.job_failed(&name);
        self.emit_state(&name).await;
        self.emit_steps().await;
    }
}

/// Next control message. Once every handle is gone the sequence keeps
/// running on its own, so this never resolves again.
async fn recv_control(rx: &mut mpsc::Receiver<Control>, closed: &mut bool) -> Control {
    if !*closed {
        if let Some(control) = rx.recv().await {
            return control;
        }
        *closed = true;
    }
    std::future::pending().await
}
