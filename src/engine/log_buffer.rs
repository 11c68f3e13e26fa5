// src/engine/log_buffer.rs

//! Display log: an append-only list of text chunks.
//!
//! Producers (the monitor, local actions) write through a [`LogSink`]; a
//! flusher task collects chunks and sends them downstream as one
//! [`SequenceEvent::Log`] batch per `log_flush_interval`, so a burst of
//! output becomes a handful of UI updates. The log is never used for control
//! flow.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::engine::SequenceEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffer {
    chunks: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: impl Into<String>) {
        self.chunks.push(chunk.into());
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn text(&self) -> String {
        self.chunks.join("\n")
    }
}

/// Cheap, cloneable writer into the display log.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    pub fn log(&self, chunk: impl Into<String>) {
        // The flusher only goes away at the end of the sequence.
        let _ = self.tx.send(chunk.into());
    }

    /// A sink whose chunks go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Handle to the background flusher task.
#[derive(Debug)]
pub struct LogFlusher {
    sink: LogSink,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<LogBuffer>,
}

impl LogFlusher {
    pub fn spawn(interval: Duration, events: mpsc::Sender<SequenceEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let interval = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(flush_loop(interval, rx, stop_rx, events));
        Self {
            sink: LogSink { tx },
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    /// Flush whatever is pending and return the complete log.
    pub async fn finish(mut self) -> LogBuffer {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap_or_default()
    }
}

async fn flush_loop(
    interval: Duration,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut stop_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<SequenceEvent>,
) -> LogBuffer {
    let mut buffer = LogBuffer::new();
    let mut pending: Vec<String> = Vec::new();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    buffer.push(chunk.clone());
                    pending.push(chunk);
                }
                None => break,
            },

            _ = &mut stop_rx => {
                while let Ok(chunk) = rx.try_recv() {
                    buffer.push(chunk.clone());
                    pending.push(chunk);
                }
                break;
            }

            _ = ticker.tick() => flush(&mut pending, &events).await,
        }
    }

    flush(&mut pending, &events).await;
    debug!(chunks = buffer.len(), "log flusher stopped");
    buffer
}

async fn flush(pending: &mut Vec<String>, events: &mpsc::Sender<SequenceEvent>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    // The consumer may have stopped listening; the buffer is still returned.
    let _ = events.send(SequenceEvent::Log(batch)).await;
}
