// src/engine/local.rs

//! Local actions as pseudo-jobs.
//!
//! A [`LocalAction`] is an in-process async function. The adapter runs it
//! and reports the same event shape a remote job would, on a regular
//! [`Subscription`]: `Start(job)`, then `Stop(job)` or `Error(job, msg)`,
//! then the terminal `End`. The event name is the job's own name.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{PushEvent, Subscription};
use crate::engine::log_buffer::LogSink;
use crate::job::EventRecord;

type ActionFn = dyn Fn(LogSink) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Shared async closure run as a local job. Receives a sink for display
/// log output.
#[derive(Clone)]
pub struct LocalAction(Arc<ActionFn>);

impl LocalAction {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(LogSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |sink| f(sink).boxed()))
    }

    pub fn call(&self, sink: LogSink) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.0)(sink)
    }
}

impl fmt::Debug for LocalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalAction(..)")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalActionAdapter;

impl LocalActionAdapter {
    /// Start `action` for `job` and return its event stream. Closing the
    /// subscription aborts the action.
    pub fn start(&self, job: &str, action: &LocalAction, log: LogSink) -> Subscription {
        let (tx, rx) = mpsc::channel(8);
        let (unsub_tx, unsub_rx) = oneshot::channel();
        let job_name = job.to_string();
        let fut = action.call(log);

        tokio::spawn(run_action(job_name, fut, tx, unsub_rx));
        Subscription::new(job, rx, Some(unsub_tx))
    }
}

async fn run_action(
    job: String,
    fut: BoxFuture<'static, anyhow::Result<()>>,
    tx: mpsc::Sender<PushEvent>,
    unsub_rx: oneshot::Receiver<()>,
) {
    info!(job = %job, "starting local action");
    let _ = tx.send(PushEvent::Event(EventRecord::start(&job))).await;

    let result = tokio::select! {
        res = fut => res,
        _ = unsub_rx => {
            debug!(job = %job, "local action aborted by subscriber");
            return;
        }
    };

    let (event, end) = match result {
        Ok(()) => {
            info!(job = %job, "local action finished");
            (EventRecord::stop(&job), PushEvent::end(0))
        }
        Err(err) => {
            warn!(job = %job, error = %err, "local action failed");
            (EventRecord::error(&job, format!("{err:#}")), PushEvent::end(1))
        }
    };
    let _ = tx.send(PushEvent::Event(event)).await;
    let _ = tx.send(end).await;
}
