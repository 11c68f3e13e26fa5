// src/store/mod.rs

//! Cross-restart persistence of the job-status ledger.
//!
//! The sequencer is the only writer: it calls [`StatusStore::persist`] after
//! every ledger transition. [`StatusStore::load`] is called once per start,
//! before the resume point is computed.
//!
//! - [`file`] stores the ledger as pretty-printed JSON through a
//!   [`FileSystem`](crate::fs::FileSystem), replacing it atomically.
//! - [`MemoryStatusStore`] keeps it in memory (tests, embedding callers that
//!   persist elsewhere).

use std::fmt::Debug;
use std::sync::Mutex;

use crate::errors::{JobtrainError, Result};
use crate::job::GlobalStatus;

pub mod file;

pub use file::FileStatusStore;

pub trait StatusStore: Send + Sync + Debug {
    fn load(&self) -> Result<GlobalStatus>;
    fn persist(&self, status: &GlobalStatus) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    status: Mutex<GlobalStatus>,
    persists: Mutex<usize>,
}

impl MemoryStatusStore {
    pub fn new(initial: GlobalStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            persists: Mutex::new(0),
        }
    }

    /// Last persisted ledger.
    pub fn snapshot(&self) -> GlobalStatus {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn persist_count(&self) -> usize {
        self.persists.lock().map(|n| *n).unwrap_or_default()
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self) -> Result<GlobalStatus> {
        Ok(self.snapshot())
    }

    fn persist(&self, status: &GlobalStatus) -> Result<()> {
        let mut guard = self
            .status
            .lock()
            .map_err(|_| JobtrainError::Store("memory ledger mutex poisoned".into()))?;
        *guard = status.clone();
        drop(guard);

        if let Ok(mut n) = self.persists.lock() {
            *n += 1;
        }
        Ok(())
    }
}
