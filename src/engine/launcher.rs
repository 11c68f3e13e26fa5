// src/engine/launcher.rs

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};

use crate::backend::{ExecutionBackend, Submission};

/// Submits remote jobs. A rejected submission is returned as an error and
/// is final for this attempt: the launcher never retries.
#[derive(Clone)]
pub struct RemoteJobLauncher {
    backend: Arc<dyn ExecutionBackend>,
}

impl RemoteJobLauncher {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend }
    }

    pub async fn launch(&self, name: &str, payload: &Value) -> anyhow::Result<Submission> {
        info!(job = %name, "submitting job");
        let submission = self
            .backend
            .submit(name, payload)
            .await
            .with_context(|| format!("submitting job '{name}'"));

        match &submission {
            Ok(Submission::Started(id)) => info!(job = %name, id = %id, "job accepted"),
            Ok(Submission::Partial(partial)) => {
                warn!(job = %name, message = %partial.message, "job partially failed")
            }
            Err(err) => warn!(job = %name, error = %format!("{err:#}"), "job rejected"),
        }
        submission
    }
}
