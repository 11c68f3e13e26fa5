// src/lib.rs

pub mod actions;
pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod job;
pub mod logging;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info, warn};

use crate::backend::ProcessBackend;
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{
    plan_resume, Confirmer, Decision, JobSequencer, PolicyConfirmer, PromptConfirmer,
    ResumePoint, SequenceEvent,
};
use crate::fs::RealFileSystem;
use crate::job::{GlobalStatus, JobKind};
use crate::store::{FileStatusStore, StatusStore};
use crate::types::JobState;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the persisted ledger (`--reset`, `--retry`)
/// - the process backend and the partial-failure confirmer
/// - the sequencer, whose events are printed to stdout
/// - Ctrl-C handling (cancels the in-progress job)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    let state_file = args
        .state
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.engine.state_file.clone());
    let store = Arc::new(FileStatusStore::new(Arc::new(RealFileSystem), state_file));

    if args.reset {
        store.clear()?;
    }

    let mut ledger = store.load()?;

    if let Some(job) = args.retry.as_deref() {
        if !cfg.jobs.iter().any(|spec| spec.name == job) {
            bail!("--retry: no job named '{job}' in the config");
        }
        if ledger.retry(job) {
            store.persist(&ledger)?;
            info!(job = %job, "job reset for retry");
        } else {
            info!(job = %job, "job has no recorded status; nothing to retry");
        }
    }

    if args.dry_run {
        print_dry_run(&cfg, &ledger);
        return Ok(());
    }

    let backend = Arc::new(ProcessBackend::new(cfg.backend.clone()));
    let confirmer: Arc<dyn Confirmer> = if args.yes {
        Arc::new(PolicyConfirmer(Decision::Continue))
    } else {
        match PolicyConfirmer::from_policy(cfg.engine.on_partial_failure) {
            Some(confirmer) => Arc::new(confirmer),
            None => Arc::new(PromptConfirmer),
        }
    };

    let sequencer = JobSequencer::new(backend, store, confirmer, cfg.engine.options());
    let mut run = sequencer.run(cfg.jobs.clone(), cfg.steps.clone(), ledger)?;

    // Ctrl-C → cancel the in-progress job.
    {
        let cancel = run.cancel_handle();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            warn!("Ctrl+C received; cancelling the in-progress job");
            cancel.cancel();
        });
    }

    while let Some(event) = run.next_event().await {
        print_event(&event);
    }

    let outcome = run.wait().await?;
    debug!(steps = ?outcome.steps, "final step states");

    match outcome.status {
        JobState::Complete => Ok(()),
        _ => match outcome.error {
            Some(err) => Err(anyhow!(err)),
            None => Err(anyhow!("sequence ended in state {}", outcome.status)),
        },
    }
}

fn print_event(event: &SequenceEvent) {
    match event {
        SequenceEvent::JobLaunched {
            index,
            name,
            correlation_id,
        } => match correlation_id {
            Some(id) => println!("==> [{}] {name} launched ({id})", index + 1),
            None => println!("==> [{}] {name} started", index + 1),
        },
        SequenceEvent::JobReattached {
            index,
            name,
            correlation_id,
        } => println!("==> [{}] {name} still running ({correlation_id}); reattached", index + 1),
        SequenceEvent::JobState { name, state } => println!("    {name}: {state}"),
        SequenceEvent::Event { job, record } => {
            debug!(job = %job, event = %record.event_name, kind = ?record.kind, "event");
        }
        SequenceEvent::Steps(steps) => {
            let line = steps
                .iter()
                .map(|s| format!("{} [{}]", s.label, s.status))
                .collect::<Vec<_>>()
                .join(" | ");
            if !line.is_empty() {
                println!("    steps: {line}");
            }
        }
        SequenceEvent::Log(chunks) => {
            for chunk in chunks {
                println!("    | {chunk}");
            }
        }
        SequenceEvent::ConfirmationRequested { job, message } => {
            println!("??? {job}: {message}");
        }
        SequenceEvent::Status { status, error } => match error {
            Some(err) => println!("=== {status}: {err}"),
            None => println!("=== {status}"),
        },
    }
}

/// Dry-run output: jobs, steps and where a real run would resume.
fn print_dry_run(cfg: &ConfigFile, ledger: &GlobalStatus) {
    println!("jobtrain dry-run");
    println!("  engine.state_file = {}", cfg.engine.state_file.display());
    println!("  backend.work_dir = {}", cfg.backend.work_dir.display());
    println!();

    println!("jobs ({}):", cfg.jobs.len());
    for (i, spec) in cfg.jobs.iter().enumerate() {
        let state = ledger.state_of(&spec.name);
        match &spec.kind {
            JobKind::Remote { payload } => {
                println!("  {}. {} (remote) [{state}]", i + 1, spec.name);
                println!("      payload: {payload}");
            }
            JobKind::Local { .. } => println!("  {}. {} (local) [{state}]", i + 1, spec.name),
        }
        if let Some(id) = ledger.correlation_id_of(&spec.name) {
            println!("      correlation id: {id}");
        }
    }
    println!();

    println!("steps ({}):", cfg.steps.len());
    for step in &cfg.steps {
        println!("  - {} ({:?}): {:?}", step.label, step.policy, step.event_names);
    }
    println!();

    let plan = plan_resume(&cfg.jobs, ledger);
    let name = |i: usize| cfg.jobs[i].name.as_str();
    match plan.point {
        ResumePoint::Launch(i) => println!("next: launch '{}'", name(i)),
        ResumePoint::Reattach {
            index,
            correlation_id,
        } => println!("next: reattach to '{}' ({correlation_id})", name(index)),
        ResumePoint::Halted { index } => {
            println!("next: halted at job '{}' (use --retry)", name(index))
        }
        ResumePoint::Finished => println!("next: nothing, every job is complete"),
    }

    debug!("dry-run complete (no execution)");
}
