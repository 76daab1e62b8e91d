//! Observable holder of the workflow state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{reduce, WorkflowAction, WorkflowState};
use crate::storage::{SnapshotStore, WorkflowSnapshot};
use crate::sync::now_millis;

/// Owns the [`WorkflowState`] and publishes every change to subscribers.
///
/// With a snapshot store attached, each change to a persisted field is
/// written to the slot and the slot is read back on construction.
pub struct WorkflowStore {
    state: watch::Sender<WorkflowState>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    max_snapshot_age: Duration,
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStore {
    /// A store without persistence
    pub fn new() -> Self {
        let (state, _) = watch::channel(WorkflowState::default());
        Self {
            state,
            snapshots: None,
            max_snapshot_age: Duration::ZERO,
        }
    }

    /// A store backed by `snapshots`, restoring the saved workflow if it is
    /// younger than `max_snapshot_age`
    pub fn with_snapshots(snapshots: Arc<dyn SnapshotStore>, max_snapshot_age: Duration) -> Self {
        let (state, _) = watch::channel(WorkflowState::default());
        let store = Self {
            state,
            snapshots: Some(snapshots),
            max_snapshot_age,
        };
        store.restore(now_millis());
        store
    }

    /// Apply an action. Returns whether the state changed.
    pub fn dispatch(&self, action: WorkflowAction) -> bool {
        self.dispatch_at(action, now_millis())
    }

    /// Apply an action with an explicit clock
    pub fn dispatch_at(&self, action: WorkflowAction, now_ms: i64) -> bool {
        let restoring = matches!(action, WorkflowAction::RestoreSnapshot(_));
        let resetting = matches!(action, WorkflowAction::Reset);

        let mut to_persist = None;
        let changed = self.state.send_if_modified(|state| {
            let before = std::mem::take(state);
            *state = reduce(before.clone(), action, now_ms);
            if !restoring && WorkflowSnapshot::differs(&before, state) {
                to_persist = Some(WorkflowSnapshot::capture(state, now_ms));
            }
            *state != before
        });

        if resetting {
            self.clear_snapshot();
        } else if let Some(snapshot) = to_persist {
            self.persist(&snapshot);
        }
        changed
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    /// Borrow the current state for a short read
    pub fn read<R>(&self, f: impl FnOnce(&WorkflowState) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    fn persist(&self, snapshot: &WorkflowSnapshot) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if let Err(e) = snapshots.save(snapshot) {
            warn!("Failed to persist workflow snapshot: {}", e);
        }
    }

    fn clear_snapshot(&self) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        if let Err(e) = snapshots.clear() {
            warn!("Failed to clear workflow snapshot: {}", e);
        }
    }

    fn restore(&self, now_ms: i64) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        match snapshots.load() {
            Ok(Some(snapshot)) => {
                let age = snapshot.age_ms(now_ms);
                if age >= self.max_snapshot_age.as_millis() as i64 {
                    info!("Discarding workflow snapshot saved {}ms ago", age);
                    return;
                }
                info!("Restoring workflow snapshot saved {}ms ago", age);
                self.dispatch_at(WorkflowAction::RestoreSnapshot(snapshot), now_ms);
            }
            Ok(None) => debug!("No workflow snapshot to restore"),
            Err(e) => warn!("Ignoring unreadable workflow snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;
    use crate::workflow::{ServiceType, WorkflowStep};
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn update(field: &str, value: serde_json::Value) -> WorkflowAction {
        WorkflowAction::UpdateFormField {
            field_id: field.to_string(),
            value,
        }
    }

    #[test]
    fn test_dispatch_reports_change() {
        let store = WorkflowStore::new();
        assert!(store.dispatch(update("name", json!("Alice"))));
        assert!(!store.dispatch(WorkflowAction::RemoveNotification("nope".to_string())));
        assert_eq!(store.read(|s| s.form_data["name"].clone()), json!("Alice"));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = WorkflowStore::new();
        let mut rx = store.subscribe();

        store.dispatch(WorkflowAction::SetWorkflowStep(WorkflowStep::Payment));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current_step, WorkflowStep::Payment);
    }

    #[test]
    fn test_form_changes_are_persisted() {
        let slot = Arc::new(MemorySnapshotStore::new());
        let store = WorkflowStore::with_snapshots(slot.clone(), DAY);

        store.dispatch(WorkflowAction::SetLoading(true));
        assert!(slot.is_empty());

        store.dispatch_at(update("name", json!("Alice")), 5_000);
        let saved = slot.load().unwrap().unwrap();
        assert_eq!(saved.form_data["name"], json!("Alice"));
        assert_eq!(saved.saved_at, 5_000);
    }

    #[test]
    fn test_fresh_snapshot_is_restored() {
        let slot = Arc::new(MemorySnapshotStore::new());
        {
            let store = WorkflowStore::with_snapshots(slot.clone(), DAY);
            store.dispatch(WorkflowAction::SetServiceType(ServiceType::VideoNotary));
            store.dispatch(update("name", json!("Alice")));
        }

        let store = WorkflowStore::with_snapshots(slot, DAY);
        let state = store.snapshot();
        assert_eq!(state.form_data["name"], json!("Alice"));
        assert_eq!(state.selected_service, Some(ServiceType::VideoNotary));
        assert!(state.is_collaborative);
    }

    #[test]
    fn test_stale_snapshot_is_discarded() {
        let slot = Arc::new(MemorySnapshotStore::new());
        let mut state = WorkflowState::default();
        state.form_data.insert("name".to_string(), json!("Old"));
        let saved_at = now_millis() - DAY.as_millis() as i64 - 1;
        slot.save(&WorkflowSnapshot::capture(&state, saved_at)).unwrap();

        let store = WorkflowStore::with_snapshots(slot, DAY);
        assert!(store.snapshot().form_data.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let slot = Arc::new(MemorySnapshotStore::with_raw("{\"savedAt\": \"yesterday\"}"));
        let store = WorkflowStore::with_snapshots(slot, DAY);
        assert_eq!(store.snapshot(), WorkflowState::default());
    }

    #[test]
    fn test_reset_clears_slot() {
        let slot = Arc::new(MemorySnapshotStore::new());
        let store = WorkflowStore::with_snapshots(slot.clone(), DAY);
        store.dispatch(WorkflowAction::SetUserId("u-client".to_string()));
        store.dispatch(update("name", json!("Alice")));
        assert!(!slot.is_empty());

        store.dispatch(WorkflowAction::Reset);
        assert!(slot.is_empty());
        assert_eq!(store.read(|s| s.user_id.clone()).as_deref(), Some("u-client"));
    }
}
