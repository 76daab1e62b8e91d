//! Pure transition function for [`WorkflowState`].
//!
//! Remote writes are merged per logical field with last-writer-wins on the
//! sender timestamp: a write is applied only if its timestamp is strictly
//! newer than the last one applied to that field. Local edits stamp the
//! field with the local clock so older remote writes cannot overwrite them.

use serde_json::Value;

use super::{
    Collaborator, DocumentConfig, Notification, ServiceType, SignatureRecord, SyncOrigin,
    WorkflowState, WorkflowStep,
};
use crate::storage::WorkflowSnapshot;
use crate::sync::protocol::ParticipantRole;
use crate::sync::{FieldId, FormData, ParticipantId, SessionId};

const WORKFLOW_STATUS_KEY: &str = "workflow_status";

fn form_key(field_id: &str) -> String {
    format!("form:{}", field_id)
}

fn signature_key(field_id: &str) -> String {
    format!("signature:{}", field_id)
}

/// Every way the workflow state can change
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowAction {
    SetDocumentType {
        document_type: String,
        config: Option<DocumentConfig>,
    },
    UpdateFormField {
        field_id: FieldId,
        value: Value,
    },
    /// Replace the whole form
    SetFormData(FormData),
    NextSection,
    PreviousSection,
    SetSection(usize),
    SetWorkflowStep(WorkflowStep),
    SetServiceType(ServiceType),
    SetUserRole(ParticipantRole),
    SetUserId(ParticipantId),
    SetSessionId(SessionId),
    StartVideoCall {
        meeting_id: Option<String>,
    },
    EndVideoCall,
    AddCollaborator(Collaborator),
    RemoveCollaborator(ParticipantId),
    /// Remote form values stamped by the sender
    MergeSyncedFormData {
        form_data: FormData,
        timestamp: i64,
    },
    AddSignature {
        field_id: FieldId,
        signature: String,
        signed_by: String,
    },
    /// Remote signature stamped by the sender
    SyncSignature {
        field_id: FieldId,
        signature: String,
        signed_by: String,
        timestamp: i64,
    },
    SetDocumentStatus(String),
    /// Remote workflow status stamped by the sender
    SyncWorkflowStatus {
        status: String,
        step: WorkflowStep,
        timestamp: i64,
    },
    SetLoading(bool),
    SetError(Option<String>),
    AddNotification(Notification),
    RemoveNotification(String),
    RestoreSnapshot(WorkflowSnapshot),
    /// Back to a fresh workflow, keeping who we are and which session we're in
    Reset,
}

/// Apply an action. `now_ms` stamps local writes.
pub fn reduce(mut state: WorkflowState, action: WorkflowAction, now_ms: i64) -> WorkflowState {
    match action {
        WorkflowAction::SetDocumentType {
            document_type,
            config,
        } => {
            state.selected_document_type = Some(document_type);
            state.document_config = config;
            state.current_form_section = 0;
        }

        WorkflowAction::UpdateFormField { field_id, value } => {
            state.field_clock.insert(form_key(&field_id), now_ms);
            state.form_data.insert(field_id, value);
            mark_synced(&mut state, now_ms, SyncOrigin::Local);
        }

        WorkflowAction::SetFormData(form_data) => {
            state.field_clock.retain(|key, _| !key.starts_with("form:"));
            for field_id in form_data.keys() {
                state.field_clock.insert(form_key(field_id), now_ms);
            }
            state.form_data = form_data;
            mark_synced(&mut state, now_ms, SyncOrigin::Local);
        }

        WorkflowAction::NextSection => {
            state.current_form_section = clamp_section(&state, state.current_form_section + 1);
        }

        WorkflowAction::PreviousSection => {
            state.current_form_section = state.current_form_section.saturating_sub(1);
        }

        WorkflowAction::SetSection(section) => {
            state.current_form_section = clamp_section(&state, section);
        }

        WorkflowAction::SetWorkflowStep(step) => {
            state.current_step = step;
            state.field_clock.insert(WORKFLOW_STATUS_KEY.to_string(), now_ms);
        }

        WorkflowAction::SetServiceType(service) => {
            state.selected_service = Some(service);
            state.is_collaborative = service.is_collaborative();
        }

        WorkflowAction::SetUserRole(role) => state.user_role = Some(role),
        WorkflowAction::SetUserId(id) => state.user_id = Some(id),
        WorkflowAction::SetSessionId(id) => state.session_id = Some(id),

        WorkflowAction::StartVideoCall { meeting_id } => {
            state.is_video_call_active = true;
            state.meeting_id = meeting_id;
        }

        WorkflowAction::EndVideoCall => {
            state.is_video_call_active = false;
            state.meeting_id = None;
        }

        WorkflowAction::AddCollaborator(collaborator) => {
            match state
                .collaborators
                .iter_mut()
                .find(|c| c.id == collaborator.id)
            {
                Some(existing) => existing.role = collaborator.role,
                None => state.collaborators.push(collaborator),
            }
        }

        WorkflowAction::RemoveCollaborator(id) => {
            state.collaborators.retain(|c| c.id != id);
        }

        WorkflowAction::MergeSyncedFormData {
            form_data,
            timestamp,
        } => {
            let mut applied = false;
            for (field_id, value) in form_data {
                if accept(&mut state, form_key(&field_id), timestamp) {
                    state.form_data.insert(field_id, value);
                    applied = true;
                }
            }
            if applied {
                mark_synced(&mut state, now_ms, SyncOrigin::Remote);
            }
        }

        WorkflowAction::AddSignature {
            field_id,
            signature,
            signed_by,
        } => {
            state.field_clock.insert(signature_key(&field_id), now_ms);
            state.signatures.insert(
                field_id,
                SignatureRecord {
                    signature,
                    signed_by,
                    signed_at: now_ms,
                },
            );
            mark_synced(&mut state, now_ms, SyncOrigin::Local);
        }

        WorkflowAction::SyncSignature {
            field_id,
            signature,
            signed_by,
            timestamp,
        } => {
            if accept(&mut state, signature_key(&field_id), timestamp) {
                state.signatures.insert(
                    field_id,
                    SignatureRecord {
                        signature,
                        signed_by,
                        signed_at: timestamp,
                    },
                );
                mark_synced(&mut state, now_ms, SyncOrigin::Remote);
            }
        }

        WorkflowAction::SetDocumentStatus(status) => {
            state.document_status = Some(status);
            state.field_clock.insert(WORKFLOW_STATUS_KEY.to_string(), now_ms);
        }

        WorkflowAction::SyncWorkflowStatus {
            status,
            step,
            timestamp,
        } => {
            if accept(&mut state, WORKFLOW_STATUS_KEY.to_string(), timestamp) {
                state.document_status = Some(status);
                state.current_step = step;
                mark_synced(&mut state, now_ms, SyncOrigin::Remote);
            }
        }

        WorkflowAction::SetLoading(loading) => state.is_loading = loading,
        WorkflowAction::SetError(error) => state.error = error,

        WorkflowAction::AddNotification(notification) => {
            state.notifications.retain(|n| n.id != notification.id);
            state.notifications.push(notification);
        }

        WorkflowAction::RemoveNotification(id) => {
            state.notifications.retain(|n| n.id != id);
        }

        WorkflowAction::RestoreSnapshot(snapshot) => {
            state.selected_document_type = snapshot.selected_document_type;
            state.form_data = snapshot.form_data;
            state.current_form_section = snapshot.current_form_section;
            state.selected_service = snapshot.selected_service;
            state.is_collaborative = snapshot
                .selected_service
                .map_or(false, |s| s.is_collaborative());
            state.current_step = snapshot.current_step;
        }

        WorkflowAction::Reset => {
            state = WorkflowState {
                user_id: state.user_id,
                session_id: state.session_id,
                ..WorkflowState::default()
            };
        }
    }

    state
}

/// Record `timestamp` for `key` if it is strictly newer than what was applied
fn accept(state: &mut WorkflowState, key: String, timestamp: i64) -> bool {
    match state.field_clock.get(&key) {
        Some(&applied) if applied >= timestamp => false,
        _ => {
            state.field_clock.insert(key, timestamp);
            true
        }
    }
}

fn mark_synced(state: &mut WorkflowState, now_ms: i64, origin: SyncOrigin) {
    state.last_sync_time = Some(now_ms);
    state.last_sync_origin = Some(origin);
}

fn clamp_section(state: &WorkflowState, section: usize) -> usize {
    match state.section_count() {
        Some(0) => 0,
        Some(count) => section.min(count - 1),
        None => section,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(field: &str, value: Value) -> FormData {
        FormData::from([(field.to_string(), value)])
    }

    fn merge(state: WorkflowState, field: &str, value: Value, timestamp: i64) -> WorkflowState {
        reduce(
            state,
            WorkflowAction::MergeSyncedFormData {
                form_data: patch(field, value),
                timestamp,
            },
            1_000,
        )
    }

    #[test]
    fn test_stale_remote_write_is_ignored() {
        let state = merge(WorkflowState::default(), "name", json!("B"), 100);
        let state = merge(state, "name", json!("A"), 50);

        assert_eq!(state.form_data["name"], json!("B"));
        assert_eq!(state.field_clock["form:name"], 100);
    }

    #[test]
    fn test_equal_timestamp_is_not_newer() {
        let state = merge(WorkflowState::default(), "name", json!("B"), 100);
        let state = merge(state, "name", json!("C"), 100);
        assert_eq!(state.form_data["name"], json!("B"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let action = WorkflowAction::SyncSignature {
            field_id: "clientSignature".to_string(),
            signature: "sig".to_string(),
            signed_by: "client".to_string(),
            timestamp: 500,
        };

        let once = reduce(WorkflowState::default(), action.clone(), 1_000);
        let twice = reduce(once.clone(), action, 2_000);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bulk_merge_is_per_field() {
        let state = merge(WorkflowState::default(), "name", json!("Newer"), 200);

        let mut bulk = FormData::new();
        bulk.insert("name".to_string(), json!("Older"));
        bulk.insert("city".to_string(), json!("Lagos"));
        let state = reduce(
            state,
            WorkflowAction::MergeSyncedFormData {
                form_data: bulk,
                timestamp: 150,
            },
            1_000,
        );

        assert_eq!(state.form_data["name"], json!("Newer"));
        assert_eq!(state.form_data["city"], json!("Lagos"));
    }

    #[test]
    fn test_local_edit_beats_older_remote() {
        let state = reduce(
            WorkflowState::default(),
            WorkflowAction::UpdateFormField {
                field_id: "name".to_string(),
                value: json!("Local"),
            },
            5_000,
        );
        assert_eq!(state.last_sync_origin, Some(SyncOrigin::Local));

        let state = merge(state, "name", json!("Remote"), 4_000);
        assert_eq!(state.form_data["name"], json!("Local"));

        let state = merge(state, "name", json!("Remote"), 6_000);
        assert_eq!(state.form_data["name"], json!("Remote"));
        assert_eq!(state.last_sync_origin, Some(SyncOrigin::Remote));
    }

    #[test]
    fn test_workflow_status_lww() {
        let state = reduce(
            WorkflowState::default(),
            WorkflowAction::SyncWorkflowStatus {
                status: "signing".to_string(),
                step: WorkflowStep::DocumentSigning,
                timestamp: 300,
            },
            1_000,
        );
        let state = reduce(
            state,
            WorkflowAction::SyncWorkflowStatus {
                status: "video".to_string(),
                step: WorkflowStep::VideoCall,
                timestamp: 200,
            },
            1_000,
        );

        assert_eq!(state.current_step, WorkflowStep::DocumentSigning);
        assert_eq!(state.document_status.as_deref(), Some("signing"));
    }

    #[test]
    fn test_service_type_derives_collaborative() {
        let state = reduce(
            WorkflowState::default(),
            WorkflowAction::SetServiceType(ServiceType::VideoNotary),
            0,
        );
        assert!(state.is_collaborative);

        let state = reduce(state, WorkflowAction::SetServiceType(ServiceType::SelfSign), 0);
        assert!(!state.is_collaborative);
    }

    #[test]
    fn test_section_navigation_is_clamped() {
        let config = DocumentConfig::new(
            "Affidavit",
            vec!["Personal".to_string(), "Statement".to_string()],
        );
        let mut state = reduce(
            WorkflowState::default(),
            WorkflowAction::SetDocumentType {
                document_type: "affidavit".to_string(),
                config: Some(config),
            },
            0,
        );

        for _ in 0..5 {
            state = reduce(state, WorkflowAction::NextSection, 0);
        }
        assert_eq!(state.current_form_section, 1);

        for _ in 0..5 {
            state = reduce(state, WorkflowAction::PreviousSection, 0);
        }
        assert_eq!(state.current_form_section, 0);

        state = reduce(state, WorkflowAction::SetSection(9), 0);
        assert_eq!(state.current_form_section, 1);
    }

    #[test]
    fn test_collaborators_are_unique() {
        let collaborator = Collaborator {
            id: "u-notary".to_string(),
            role: ParticipantRole::Notary,
            joined_at: 10,
        };

        let state = reduce(
            WorkflowState::default(),
            WorkflowAction::AddCollaborator(collaborator.clone()),
            0,
        );
        let again = reduce(
            state.clone(),
            WorkflowAction::AddCollaborator(Collaborator {
                joined_at: 99,
                ..collaborator
            }),
            0,
        );
        assert_eq!(state, again);

        let state = reduce(again, WorkflowAction::RemoveCollaborator("u-notary".to_string()), 0);
        assert!(state.collaborators.is_empty());
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut state = WorkflowState::default();
        for action in [
            WorkflowAction::SetUserId("u-client".to_string()),
            WorkflowAction::SetSessionId("session-1".to_string()),
            WorkflowAction::SetUserRole(ParticipantRole::Client),
            WorkflowAction::SetServiceType(ServiceType::VideoNotary),
            WorkflowAction::UpdateFormField {
                field_id: "name".to_string(),
                value: json!("Alice"),
            },
        ] {
            state = reduce(state, action, 10);
        }

        let state = reduce(state, WorkflowAction::Reset, 20);
        assert_eq!(state.user_id.as_deref(), Some("u-client"));
        assert_eq!(state.session_id.as_deref(), Some("session-1"));
        assert_eq!(state.user_role, None);
        assert!(state.form_data.is_empty());
        assert!(state.field_clock.is_empty());
        assert!(!state.is_collaborative);
    }

    #[test]
    fn test_add_signature_stamps_local_clock() {
        let state = reduce(
            WorkflowState::default(),
            WorkflowAction::AddSignature {
                field_id: "clientSignature".to_string(),
                signature: "local".to_string(),
                signed_by: "client".to_string(),
            },
            800,
        );
        assert_eq!(state.signature("clientSignature").unwrap().signed_at, 800);

        let state = reduce(
            state,
            WorkflowAction::SyncSignature {
                field_id: "clientSignature".to_string(),
                signature: "remote".to_string(),
                signed_by: "notary".to_string(),
                timestamp: 700,
            },
            900,
        );
        assert_eq!(state.signature("clientSignature").unwrap().signature, "local");
    }
}
