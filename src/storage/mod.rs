//! Storage module for the best-effort workflow snapshot.
//!
//! A snapshot lets a participant resume a half-filled form after a reload. It
//! lives in a single named slot and is a cache only: collaborative state is
//! reconciled through the sync engine, never from the slot.

mod sled_store;

pub use sled_store::{SledSnapshotStore, StorageError, StorageResult};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sync::FormData;
use crate::workflow::{ServiceType, WorkflowState, WorkflowStep};

/// The persisted subset of workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub selected_document_type: Option<String>,
    #[serde(default)]
    pub form_data: FormData,
    #[serde(default)]
    pub current_form_section: usize,
    pub selected_service: Option<ServiceType>,
    #[serde(default)]
    pub current_step: WorkflowStep,
    /// Milliseconds since the epoch
    pub saved_at: i64,
}

impl WorkflowSnapshot {
    pub fn capture(state: &WorkflowState, saved_at: i64) -> Self {
        Self {
            selected_document_type: state.selected_document_type.clone(),
            form_data: state.form_data.clone(),
            current_form_section: state.current_form_section,
            selected_service: state.selected_service,
            current_step: state.current_step,
            saved_at,
        }
    }

    /// Whether two states differ in any persisted field
    pub(crate) fn differs(a: &WorkflowState, b: &WorkflowState) -> bool {
        a.selected_document_type != b.selected_document_type
            || a.form_data != b.form_data
            || a.current_form_section != b.current_form_section
            || a.selected_service != b.selected_service
            || a.current_step != b.current_step
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.saved_at
    }
}

/// A single durable slot holding the latest snapshot
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()>;

    fn load(&self) -> StorageResult<Option<WorkflowSnapshot>>;

    fn clear(&self) -> StorageResult<()>;
}

/// Process-local slot. Holds the serialized form so corrupt data behaves
/// the same as on disk.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the slot with raw contents
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(raw.into())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &WorkflowSnapshot) -> StorageResult<()> {
        let raw = serde_json::to_string(snapshot)?;
        *self.slot.lock() = Some(raw);
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<WorkflowSnapshot>> {
        match self.slot.lock().as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn clear(&self) -> StorageResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Key of the snapshot slot
    pub slot: String,
    /// Snapshots older than this are discarded on restore
    pub max_snapshot_age: Duration,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/notary-sync.sled".to_string(),
            slot: "notarization_workflow_state".to_string(),
            max_snapshot_age: Duration::from_secs(24 * 60 * 60),
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("SNAPSHOT_PATH") {
            config.path = path;
        }
        if let Ok(slot) = std::env::var("SNAPSHOT_SLOT") {
            config.slot = slot;
        }
        if let Some(hours) = crate::sync::env_parse::<u64>("SNAPSHOT_MAX_AGE_HOURS") {
            config.max_snapshot_age = Duration::from_secs(hours * 60 * 60);
        }
        config
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = slot.into();
        self
    }

    pub fn with_max_snapshot_age(mut self, age: Duration) -> Self {
        self.max_snapshot_age = age;
        self
    }

    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_wire_shape() {
        let mut state = WorkflowState::default();
        state.form_data.insert("name".to_string(), json!("Alice"));
        state.selected_service = Some(ServiceType::VideoNotary);

        let value = serde_json::to_value(WorkflowSnapshot::capture(&state, 1234)).unwrap();
        assert_eq!(value["savedAt"], json!(1234));
        assert_eq!(value["formData"]["name"], json!("Alice"));
        assert_eq!(value["selectedService"], json!("video_notary"));
        assert_eq!(value["currentStep"], json!("document_selection"));
    }

    #[test]
    fn test_differs_ignores_non_persisted_fields() {
        let a = WorkflowState::default();
        let mut b = a.clone();
        b.is_loading = true;
        b.error = Some("boom".to_string());
        assert!(!WorkflowSnapshot::differs(&a, &b));

        b.current_form_section = 2;
        assert!(WorkflowSnapshot::differs(&a, &b));
    }

    #[test]
    fn test_memory_store_corrupt_slot() {
        let store = MemorySnapshotStore::with_raw("{not json");
        assert!(matches!(store.load(), Err(StorageError::Serialization(_))));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.max_snapshot_age, Duration::from_secs(86_400));
        assert_eq!(config.slot, "notarization_workflow_state");
    }
}
