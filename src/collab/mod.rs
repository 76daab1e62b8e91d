//! Binding layer between the sync engine and the workflow store.
//!
//! A [`CollaborationSession`] applies remote events to the local store and
//! pushes local edits out through the engine. This module handles:
//! - Per-field debouncing of outbound edits
//! - Echo suppression for bulk syncs right after a remote apply
//! - User-facing notifications for remote activity
//! - Teardown of every timer and listener it created

mod debounce;
mod notify;

pub use debounce::Debouncer;
pub use notify::Notifier;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::sync::events::{EventKind, ListenerId, SyncEvent};
use crate::sync::{
    now_millis, FieldId, FormData, SessionId, SyncEngine, SyncError, SyncOutcome, SyncResult,
    SyncStatus,
};
use crate::workflow::{
    Collaborator, NotificationKind, SyncOrigin, WorkflowAction, WorkflowStep, WorkflowStore,
};

/// Timing knobs for the binding layer
#[derive(Debug, Clone)]
pub struct CollaborationConfig {
    /// Quiet period before an edited field is sent
    pub debounce: Duration,
    /// Lifetime of transient notifications
    pub notification_duration: Duration,
    /// Bulk syncs are skipped this soon after a remote apply
    pub echo_window: Duration,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            notification_duration: Duration::from_millis(3000),
            echo_window: Duration::from_millis(100),
        }
    }
}

impl CollaborationConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = crate::sync::env_parse::<u64>("COLLAB_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = crate::sync::env_parse::<u64>("COLLAB_NOTIFICATION_MS") {
            config.notification_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = crate::sync::env_parse::<u64>("COLLAB_ECHO_WINDOW_MS") {
            config.echo_window = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_notification_duration(mut self, duration: Duration) -> Self {
        self.notification_duration = duration;
        self
    }

    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }
}

/// Engine status plus the collaborative view of the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationStatus {
    #[serde(flatten)]
    pub sync: SyncStatus,
    pub is_collaborative: bool,
    pub collaborators: Vec<Collaborator>,
    pub pending_edits: usize,
}

#[derive(Default)]
struct SessionGuard {
    session_id: Option<SessionId>,
    listeners: Vec<(EventKind, ListenerId)>,
}

/// One participant's side of a collaborative session
pub struct CollaborationSession {
    engine: SyncEngine,
    store: Arc<WorkflowStore>,
    config: CollaborationConfig,
    /// `None` is the bulk-sync slot
    debouncer: Debouncer<Option<FieldId>>,
    notifier: Notifier,
    guard: Mutex<SessionGuard>,
}

impl CollaborationSession {
    pub fn new(engine: SyncEngine, store: Arc<WorkflowStore>, config: CollaborationConfig) -> Self {
        let notifier = Notifier::new(store.clone(), config.notification_duration);
        Self {
            debouncer: Debouncer::new(config.debounce),
            engine,
            store,
            config,
            notifier,
            guard: Mutex::new(SessionGuard::default()),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        self.guard.lock().session_id.is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Join or create a session for the participant described by the store.
    ///
    /// Requires collaborative mode and a user role. A session id is generated
    /// when neither the caller nor the store supplies one, and so is a user
    /// id. Calling this again while started returns the current session id.
    pub async fn start(&self, session_id: Option<SessionId>) -> SyncResult<SessionId> {
        let (session_id, user_id, role) = {
            let mut guard = self.guard.lock();
            if let Some(existing) = &guard.session_id {
                debug!("Collaboration already started for session {}", existing);
                return Ok(existing.clone());
            }

            let state = self.store.snapshot();
            if !state.is_collaborative {
                return Err(SyncError::NotCollaborative);
            }
            let role = state
                .user_role
                .ok_or_else(|| SyncError::InvalidState("user role is not set".to_string()))?;
            let user_id = match state.user_id {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    self.store.dispatch(WorkflowAction::SetUserId(id.clone()));
                    id
                }
            };
            let session_id = session_id
                .or(state.session_id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            self.store
                .dispatch(WorkflowAction::SetSessionId(session_id.clone()));

            self.notifier.reopen();
            guard.session_id = Some(session_id.clone());
            guard.listeners = self.subscribe();
            (session_id, user_id, role)
        };

        info!(
            "Starting collaboration in session {} as {} ({})",
            session_id, user_id, role
        );
        if let Err(e) = self.engine.connect(session_id.clone(), user_id, role).await {
            warn!("Initial connection to session {} failed: {}", session_id, e);
            self.notifier.notify(
                NotificationKind::Warning,
                "Could not reach the collaboration service, retrying",
            );
            return Err(e);
        }
        Ok(session_id)
    }

    /// Leave the session and release every timer and listener
    pub async fn teardown(&self) {
        let (session_id, listeners) = {
            let mut guard = self.guard.lock();
            (guard.session_id.take(), std::mem::take(&mut guard.listeners))
        };

        for (kind, id) in listeners {
            self.engine.off(kind, id);
        }
        let cancelled = self.debouncer.cancel_all();
        self.notifier.close();
        self.engine.disconnect().await;

        if let Some(session_id) = session_id {
            info!(
                "Collaboration in session {} torn down ({} pending edits dropped)",
                session_id, cancelled
            );
        }
    }

    fn subscribe(&self) -> Vec<(EventKind, ListenerId)> {
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let store = self.store.clone();
                let notifier = self.notifier.clone();
                let id = self
                    .engine
                    .on(kind, move |event| apply_event(&store, &notifier, event));
                (kind, id)
            })
            .collect()
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Record a local edit and schedule it for sync
    pub fn update_field(&self, field_id: impl Into<FieldId>, value: Value) {
        let field_id = field_id.into();
        self.store.dispatch(WorkflowAction::UpdateFormField {
            field_id: field_id.clone(),
            value: value.clone(),
        });
        self.sync_form_field(field_id, value);
    }

    /// Send one field after the debounce delay. Returns false when no
    /// session is active.
    pub fn sync_form_field(&self, field_id: impl Into<FieldId>, value: Value) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let field_id = field_id.into();
        let engine = self.engine.clone();
        self.debouncer
            .schedule(Some(field_id.clone()), move || async move {
                let form_data = FormData::from([(field_id.clone(), value)]);
                engine.sync_form_data(form_data, Some(field_id)).await;
            });
        true
    }

    /// Send the whole form after the debounce delay.
    ///
    /// Skipped right after a remote apply, since the form would then echo the
    /// peer's own change back at it.
    pub fn sync_form_data(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        if self.within_echo_window(now_millis()) {
            debug!("Skipping bulk sync inside the echo window");
            return false;
        }
        let engine = self.engine.clone();
        let store = self.store.clone();
        self.debouncer.schedule(None, move || async move {
            let form_data = store.read(|s| s.form_data.clone());
            engine.sync_form_data(form_data, None).await;
        });
        true
    }

    /// Record a signature locally and send it immediately
    pub async fn sync_signature(
        &self,
        field_id: impl Into<FieldId>,
        signature: impl Into<String>,
        signed_by: impl Into<String>,
    ) -> Option<SyncOutcome> {
        let (field_id, signature, signed_by) = (field_id.into(), signature.into(), signed_by.into());
        self.store.dispatch(WorkflowAction::AddSignature {
            field_id: field_id.clone(),
            signature: signature.clone(),
            signed_by: signed_by.clone(),
        });
        if !self.is_initialized() {
            return None;
        }
        Some(
            self.engine
                .sync_signature(field_id, signature, signed_by)
                .await,
        )
    }

    /// Move the workflow locally and send the new status immediately
    pub async fn sync_workflow_status(
        &self,
        status: impl Into<String>,
        step: WorkflowStep,
    ) -> Option<SyncOutcome> {
        let status = status.into();
        self.store.dispatch(WorkflowAction::SetWorkflowStep(step));
        self.store
            .dispatch(WorkflowAction::SetDocumentStatus(status.clone()));
        if !self.is_initialized() {
            return None;
        }
        Some(self.engine.sync_workflow_status(status, step).await)
    }

    pub fn sync_status(&self) -> CollaborationStatus {
        let (is_collaborative, collaborators) = self
            .store
            .read(|s| (s.is_collaborative, s.collaborators.clone()));
        CollaborationStatus {
            sync: self.engine.status(),
            is_collaborative,
            collaborators,
            pending_edits: self.debouncer.pending(),
        }
    }

    fn within_echo_window(&self, now_ms: i64) -> bool {
        let window = self.config.echo_window.as_millis() as i64;
        self.store.read(|s| {
            s.last_sync_origin == Some(SyncOrigin::Remote)
                && s.last_sync_time.map_or(false, |t| now_ms - t < window)
        })
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        let listeners = std::mem::take(&mut self.guard.get_mut().listeners);
        for (kind, id) in listeners {
            self.engine.off(kind, id);
        }
        self.debouncer.cancel_all();
        self.notifier.close();
    }
}

/// Apply one engine event to the store, notifying only when something changed
fn apply_event(store: &WorkflowStore, notifier: &Notifier, event: &SyncEvent) {
    match event {
        SyncEvent::FormUpdate {
            origin,
            form_data,
            field_id,
        } => {
            let patch = match field_id {
                Some(field) => match form_data.get(field) {
                    Some(value) => FormData::from([(field.clone(), value.clone())]),
                    None => {
                        warn!("Form update for {} carried no value", field);
                        return;
                    }
                },
                None => form_data.clone(),
            };
            let applied = store.dispatch(WorkflowAction::MergeSyncedFormData {
                form_data: patch,
                timestamp: origin.timestamp,
            });
            if applied {
                notifier.notify(
                    NotificationKind::Info,
                    format!("{} updated the form", origin.role.label()),
                );
            }
        }

        SyncEvent::SignatureUpdate {
            origin,
            field_id,
            signature,
            signed_by,
        } => {
            let applied = store.dispatch(WorkflowAction::SyncSignature {
                field_id: field_id.clone(),
                signature: signature.clone(),
                signed_by: signed_by.clone(),
                timestamp: origin.timestamp,
            });
            if applied {
                notifier.notify(
                    NotificationKind::Success,
                    format!("{} signed {}", origin.role.label(), field_id),
                );
            }
        }

        SyncEvent::WorkflowStatusUpdate {
            origin,
            status,
            step,
        } => {
            let applied = store.dispatch(WorkflowAction::SyncWorkflowStatus {
                status: status.clone(),
                step: *step,
                timestamp: origin.timestamp,
            });
            if applied {
                notifier.notify(
                    NotificationKind::Info,
                    format!("{} moved the session to {}", origin.role.label(), step),
                );
            }
        }

        SyncEvent::UserJoined { origin } => {
            let added = store.dispatch(WorkflowAction::AddCollaborator(Collaborator {
                id: origin.user_id.clone(),
                role: origin.role,
                joined_at: origin.timestamp,
            }));
            if added {
                notifier.notify(
                    NotificationKind::Info,
                    format!("{} joined the session", origin.role.label()),
                );
            }
        }

        SyncEvent::UserLeft { origin } => {
            if store.dispatch(WorkflowAction::RemoveCollaborator(origin.user_id.clone())) {
                notifier.notify(
                    NotificationKind::Info,
                    format!("{} left the session", origin.role.label()),
                );
            }
        }

        SyncEvent::Connected { .. } => {
            notifier.notify(NotificationKind::Success, "Connected to collaborative session");
        }

        SyncEvent::Disconnected { .. } => {
            notifier.notify(
                NotificationKind::Warning,
                "Disconnected from collaborative session",
            );
        }

        SyncEvent::MaxRetriesReached { attempts } => {
            notifier.notify_persistent(
                NotificationKind::Error,
                format!(
                    "Unable to sync with the other participant after {} attempts. Changes are saved locally.",
                    attempts
                ),
            );
        }
    }
}
