// src/job/mod.rs

//! Job data model.
//!
//! - [`spec`] holds the caller-supplied `JobSpec` (remote or local).
//! - [`step`] holds the UI-facing `Step` grouping of event names.
//! - [`status`] holds the persisted `JobStatus` / `GlobalStatus` ledger.
//! - [`event`] holds `EventRecord`, the fine-grained event shape shared by
//!   remote and local jobs.

pub mod event;
pub mod spec;
pub mod status;
pub mod step;

/// Canonical job name type used throughout the engine.
pub type JobName = String;

/// Backend-assigned identifier of one job execution.
pub type CorrelationId = String;

pub use event::{EventKind, EventRecord};
pub use spec::{JobKind, JobSpec};
pub use status::{GlobalStatus, JobStatus, TransitionError};
pub use step::Step;
