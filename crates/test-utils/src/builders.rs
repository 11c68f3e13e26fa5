#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use jobtrain::backend::ExecutionBackend;
use jobtrain::engine::{Confirmer, EngineOptions, JobSequencer, LocalAction};
use jobtrain::job::{JobSpec, Step};
use jobtrain::store::MemoryStatusStore;

use crate::confirmer::ScriptedConfirmer;
use crate::fake_backend::FakeBackend;

/// Remote job whose payload the fake backend ignores.
pub fn remote(name: &str) -> JobSpec {
    JobSpec::remote(name, json!({ "cmd": format!("run {name}") }))
}

pub fn local(name: &str, action: LocalAction) -> JobSpec {
    JobSpec::local(name, action)
}

pub fn remotes(names: &[&str]) -> Vec<JobSpec> {
    names.iter().map(|n| remote(n)).collect()
}

/// `wipe` -> `wipe.yml`, `site` -> `site.yml`.
pub fn wipe_site_steps() -> Vec<Step> {
    vec![
        Step::all_of("Wipe", ["wipe.yml"]),
        Step::all_of("Deploy", ["site.yml"]),
    ]
}

/// Fast timings for tests.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        log_flush_interval: Duration::from_millis(5),
        reconnect_delay: Duration::from_millis(10),
    }
}

/// Sequencer wired to a fake backend, an in-memory store and a scripted
/// confirmer; all three are returned for inspection.
pub struct SequencerBuilder {
    backend: FakeBackend,
    store: Arc<MemoryStatusStore>,
    confirmer: ScriptedConfirmer,
    options: EngineOptions,
}

impl SequencerBuilder {
    pub fn new(backend: &FakeBackend) -> Self {
        Self {
            backend: backend.clone(),
            store: Arc::new(MemoryStatusStore::default()),
            confirmer: ScriptedConfirmer::default(),
            options: test_options(),
        }
    }

    pub fn store(mut self, store: Arc<MemoryStatusStore>) -> Self {
        self.store = store;
        self
    }

    pub fn confirmer(mut self, confirmer: ScriptedConfirmer) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> JobSequencer {
        let backend: Arc<dyn ExecutionBackend> = Arc::new(self.backend);
        let confirmer: Arc<dyn Confirmer> = Arc::new(self.confirmer);
        JobSequencer::new(backend, self.store, confirmer, self.options)
    }
}
