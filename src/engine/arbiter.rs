// src/engine/arbiter.rs

//! Partial-failure arbitration.
//!
//! A batch-style submission can come back with some targets done and some
//! failed. That is never resolved silently: the arbiter asks a
//! [`Confirmer`] and the sequence stays suspended until it answers.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::backend::PartialFailure;
use crate::job::CorrelationId;
use crate::types::ConfirmPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort,
}

/// Answers a yes/no question put to the operator.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, message: &str) -> Decision;
}

/// Fixed answer from configuration or `--yes`.
#[derive(Debug, Clone, Copy)]
pub struct PolicyConfirmer(pub Decision);

impl PolicyConfirmer {
    /// `None` for [`ConfirmPolicy::Ask`], which needs a real prompt.
    pub fn from_policy(policy: ConfirmPolicy) -> Option<Self> {
        match policy {
            ConfirmPolicy::Ask => None,
            ConfirmPolicy::Continue => Some(Self(Decision::Continue)),
            ConfirmPolicy::Abort => Some(Self(Decision::Abort)),
        }
    }
}

#[async_trait]
impl Confirmer for PolicyConfirmer {
    async fn confirm(&self, message: &str) -> Decision {
        info!(decision = ?self.0, %message, "partial failure answered by policy");
        self.0
    }
}

/// Prompts on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptConfirmer;

#[async_trait]
impl Confirmer for PromptConfirmer {
    async fn confirm(&self, message: &str) -> Decision {
        let prompt = format!("{message}\nContinue anyway?");
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(true)) => Decision::Continue,
            Ok(Ok(false)) => Decision::Abort,
            Ok(Err(err)) => {
                warn!(error = %err, "confirmation prompt failed; aborting");
                Decision::Abort
            }
            Err(err) => {
                warn!(error = %err, "confirmation prompt task failed; aborting");
                Decision::Abort
            }
        }
    }
}

/// What the sequencer does with a partially failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    Abort,
    /// Treat the job as complete.
    SoftSuccess,
    /// Wait for the follow-up's own terminal signal before resolving.
    AwaitFollowUp(CorrelationId),
}

pub struct FailureArbiter<'a> {
    confirmer: &'a dyn Confirmer,
}

impl<'a> FailureArbiter<'a> {
    pub fn new(confirmer: &'a dyn Confirmer) -> Self {
        Self { confirmer }
    }

    pub async fn arbitrate(&self, job: &str, partial: &PartialFailure) -> Arbitration {
        let decision = self.confirmer.confirm(&confirmation_message(job, partial)).await;
        info!(job = %job, ?decision, "partial failure arbitrated");

        match (decision, &partial.follow_up) {
            (Decision::Abort, _) => Arbitration::Abort,
            (Decision::Continue, Some(id)) => Arbitration::AwaitFollowUp(id.clone()),
            (Decision::Continue, None) => Arbitration::SoftSuccess,
        }
    }
}

/// Text shown to the operator.
pub fn confirmation_message(job: &str, partial: &PartialFailure) -> String {
    let mut message = format!("Job '{job}' partially failed: {}", partial.message);
    if !partial.succeeded.is_empty() {
        message.push_str(&format!("\n  succeeded: {}", partial.succeeded.join(", ")));
    }
    if !partial.failed.is_empty() {
        message.push_str(&format!("\n  failed: {}", partial.failed.join(", ")));
    }
    message
}
