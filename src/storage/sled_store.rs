//! Sled-backed snapshot slot.
//!
//! Snapshots are stored as JSON under the configured slot key in a dedicated
//! tree. One database can host several slots, one per store instance.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{SnapshotStore, StorageConfig, WorkflowSnapshot};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_SNAPSHOTS: &str = "workflow_snapshots";

#[derive(Clone)]
pub struct SledSnapshotStore {
    db: Arc<Db>,
    snapshots: Tree,
    slot: String,
}

impl SledSnapshotStore {
    /// Open or create the store at the configured path
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Self::with_db(Arc::new(db), config.slot.clone())
    }

    /// Use another slot in an already open database
    pub fn with_db(db: Arc<Db>, slot: impl Into<String>) -> StorageResult<Self> {
        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        Ok(Self {
            db,
            snapshots,
            slot: slot.into(),
        })
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn save(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.snapshots.insert(self.slot.as_bytes(), bytes)?;
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<WorkflowSnapshot>> {
        match self.snapshots.get(self.slot.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> StorageResult<()> {
        self.snapshots.remove(self.slot.as_bytes())?;
        Ok(())
    }
}

impl Drop for SledSnapshotStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
