// src/actions.rs

//! Built-in local actions available from the config file.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::backend::runner::drain_readers;
use crate::engine::local::LocalAction;
use crate::engine::log_buffer::LogSink;

/// Run `cmd` through the shell in-process; output goes to the display log.
pub fn shell_command(cmd: String) -> LocalAction {
    LocalAction::new(move |sink: LogSink| {
        let cmd = cmd.clone();
        async move { run_shell(&cmd, sink).await }
    })
}

/// Wait for `duration`, e.g. to let a cluster settle between two jobs.
pub fn delay(duration: Duration) -> LocalAction {
    LocalAction::new(move |sink: LogSink| async move {
        sink.log(format!("waiting {duration:?}"));
        tokio::time::sleep(duration).await;
        Ok(())
    })
}

async fn run_shell(cmd: &str, sink: LogSink) -> anyhow::Result<()> {
    debug!(cmd = %cmd, "running local command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning local command `{cmd}`"))?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.log(line);
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.log(line);
            }
        }));
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("waiting for local command `{cmd}`"))?;
    drain_readers(readers, cmd).await;

    if !status.success() {
        match status.code() {
            Some(code) => bail!("`{cmd}` exited with code {code}"),
            None => bail!("`{cmd}` was terminated by a signal"),
        }
    }
    Ok(())
}
