// src/backend/runner.rs

//! Individual job process runner used by [`ProcessBackend`](super::ProcessBackend).

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::EventMarkers;
use crate::job::EventRecord;

/// How long to wait for the output readers after the process exited.
/// A backgrounded grandchild may keep the pipes open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the runner needs to execute one submission.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job: String,
    pub id: String,
    /// Event name synthesized for the job as a whole.
    pub playbook: String,
    pub cmd: String,
}

/// What the runner reports back, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerOutput {
    Event(EventRecord),
    Log(String),
    Exit { code: Option<i32>, killed: bool },
}

/// Run a single job process, emitting the playbook's Start, every stdout
/// marker event and log line, the playbook's Stop/Error and finally `Exit`.
///
/// `Exit` is always the last item sent, including when the process could not
/// be spawned or was cancelled.
pub async fn run_job(
    req: RunRequest,
    markers: EventMarkers,
    out: mpsc::UnboundedSender<RunnerOutput>,
    cancel_rx: oneshot::Receiver<()>,
) {
    let job = req.job.clone();
    let id = req.id.clone();
    let playbook = req.playbook.clone();

    if let Err(err) = run_job_inner(req, markers, &out, cancel_rx).await {
        error!(job = %job, id = %id, error = %err, "job execution error");
        let _ = out.send(RunnerOutput::Event(EventRecord::error(
            &playbook,
            format!("{err:#}"),
        )));
        let _ = out.send(RunnerOutput::Exit {
            code: None,
            killed: false,
        });
    }
}

async fn run_job_inner(
    req: RunRequest,
    markers: EventMarkers,
    out: &mpsc::UnboundedSender<RunnerOutput>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Result<()> {
    info!(job = %req.job, id = %req.id, cmd = %req.cmd, "starting job process");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&req.cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&req.cmd);
        c
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for job '{}'", req.job))?;

    let _ = out.send(RunnerOutput::Event(EventRecord::start(&req.playbook)));

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);

    if let Some(stdout) = child.stdout.take() {
        let out = out.clone();
        let job = req.job.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match markers.classify(&line) {
                    Some(event) => {
                        debug!(job = %job, event = %event.event_name, kind = ?event.kind, "stdout marker");
                        let _ = out.send(RunnerOutput::Event(event));
                    }
                    None => {
                        let _ = out.send(RunnerOutput::Log(line));
                    }
                }
            }
        }));
    }

    // Always consume stderr so buffers don't fill; it is part of the job log.
    if let Some(stderr) = child.stderr.take() {
        let out = out.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = out.send(RunnerOutput::Log(line));
            }
        }));
    }

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process of job '{}'", req.job))?;

            drain_readers(readers, &req.cmd).await;

            let code = status.code();
            info!(
                job = %req.job,
                id = %req.id,
                exit_code = ?code,
                success = status.success(),
                "job process exited"
            );

            let event = if status.success() {
                EventRecord::stop(&req.playbook)
            } else {
                let reason = match code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                };
                EventRecord::error(&req.playbook, reason)
            };
            let _ = out.send(RunnerOutput::Event(event));
            let _ = out.send(RunnerOutput::Exit { code, killed: false });
        }

        cancel = &mut cancel_rx => {
            match cancel {
                Ok(()) => {
                    info!(job = %req.job, id = %req.id, "cancellation requested; killing job process");
                    if let Err(e) = child.kill().await {
                        warn!(job = %req.job, id = %req.id, error = %e, "failed to kill job process");
                    }
                }
                Err(e) => {
                    // Backend dropped; kill_on_drop takes care of the child.
                    debug!(job = %req.job, id = %req.id, error = %e, "cancel channel closed");
                }
            }
            for reader in readers {
                reader.abort();
            }
            let _ = out.send(RunnerOutput::Event(EventRecord::error(&req.playbook, "killed")));
            let _ = out.send(RunnerOutput::Exit { code: None, killed: true });
        }
    }

    Ok(())
}

/// Wait for output readers of a process that already exited, giving up on
/// each after [`READER_DRAIN_TIMEOUT`].
pub(crate) async fn drain_readers(readers: Vec<JoinHandle<()>>, cmd: &str) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!(cmd = %cmd, "output still open after exit; detaching reader");
            reader.abort();
        }
    }
}
