// src/store/file.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::{JobtrainError, Result};
use crate::fs::FileSystem;
use crate::job::GlobalStatus;
use crate::store::StatusStore;

/// JSON ledger file, e.g. `.jobtrain/status.json`.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forget every persisted status (`--reset`).
    pub fn clear(&self) -> Result<()> {
        if self.fs.exists(&self.path) {
            self.fs.remove_file(&self.path)?;
            info!(path = ?self.path, "cleared persisted job statuses");
        }
        Ok(())
    }
}

impl StatusStore for FileStatusStore {
    /// A missing or empty file is an empty ledger.
    fn load(&self) -> Result<GlobalStatus> {
        if !self.fs.exists(&self.path) {
            debug!(path = ?self.path, "no ledger file; starting fresh");
            return Ok(GlobalStatus::default());
        }

        let raw = self.fs.read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(GlobalStatus::default());
        }

        serde_json::from_str(&raw).map_err(|e| {
            JobtrainError::Store(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    fn persist(&self, status: &GlobalStatus) -> Result<()> {
        let mut payload = serde_json::to_string_pretty(status)?;
        payload.push('\n');
        self.fs.write_atomic(&self.path, payload.as_bytes())?;
        debug!(path = ?self.path, jobs = status.len(), "persisted ledger");
        Ok(())
    }
}
