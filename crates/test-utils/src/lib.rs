pub mod builders;
pub mod confirmer;
pub mod fake_backend;

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

use jobtrain::engine::{SequenceEvent, SequenceOutcome, SequenceRun};

pub use confirmer::ScriptedConfirmer;
pub use fake_backend::{FakeBackend, JobScript};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Drain a run to the end: every event it produced plus its outcome.
pub async fn drain(mut run: SequenceRun) -> (Vec<SequenceEvent>, SequenceOutcome) {
    with_timeout(async move {
        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }
        let outcome = run.wait().await.expect("sequence task panicked");
        (events, outcome)
    })
    .await
}

/// Names of launched jobs, in launch order.
pub fn launched(events: &[SequenceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SequenceEvent::JobLaunched { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}
