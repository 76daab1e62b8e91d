//! Workflow state for a notarization session.
//!
//! State is owned by [`WorkflowStore`] and only changes through
//! [`WorkflowAction`]s passed to the pure [`reduce`] function.

mod reducer;
mod store;

pub use reducer::{reduce, WorkflowAction};
pub use store::WorkflowStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::sync::protocol::ParticipantRole;
use crate::sync::{now_millis, FieldId, FormData, ParticipantId, SessionId};

/// Steps of the notarization flow, in order. Transitions are not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    #[default]
    DocumentSelection,
    FormFilling,
    ServiceSelection,
    Payment,
    VideoCall,
    DocumentSigning,
    Completed,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::DocumentSelection => "document_selection",
            WorkflowStep::FormFilling => "form_filling",
            WorkflowStep::ServiceSelection => "service_selection",
            WorkflowStep::Payment => "payment",
            WorkflowStep::VideoCall => "video_call",
            WorkflowStep::DocumentSigning => "document_signing",
            WorkflowStep::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the document gets notarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    SelfSign,
    VideoNotary,
}

impl ServiceType {
    /// Only video notarization brings a second participant
    pub fn is_collaborative(&self) -> bool {
        matches!(self, ServiceType::VideoNotary)
    }
}

/// Shape of the selected document's form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentConfig {
    pub title: String,
    /// Section titles, in display order
    pub sections: Vec<String>,
}

impl DocumentConfig {
    pub fn new(title: impl Into<String>, sections: Vec<String>) -> Self {
        Self {
            title: title.into(),
            sections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub signature: String,
    pub signed_by: String,
    pub signed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: ParticipantId,
    pub role: ParticipantRole,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing toast. Transient ones are dismissed by a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub persistent: bool,
    pub created_at: i64,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>, persistent: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message: message.into(),
            persistent,
            created_at: now_millis(),
        }
    }
}

/// Whether the last form change came from this participant or a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOrigin {
    Local,
    Remote,
}

/// Everything the UI renders for one notarization workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub selected_document_type: Option<String>,
    pub document_config: Option<DocumentConfig>,
    pub form_data: FormData,
    pub current_form_section: usize,
    pub current_step: WorkflowStep,
    pub selected_service: Option<ServiceType>,
    pub is_collaborative: bool,
    pub user_role: Option<ParticipantRole>,
    pub user_id: Option<ParticipantId>,
    pub session_id: Option<SessionId>,
    pub is_video_call_active: bool,
    pub meeting_id: Option<String>,
    pub collaborators: Vec<Collaborator>,
    pub signatures: BTreeMap<FieldId, SignatureRecord>,
    pub document_status: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub notifications: Vec<Notification>,
    pub last_sync_time: Option<i64>,
    pub last_sync_origin: Option<SyncOrigin>,
    /// Logical field key to the timestamp of the last write applied to it
    pub field_clock: BTreeMap<String, i64>,
}

impl WorkflowState {
    /// Number of form sections, if a document is selected
    pub fn section_count(&self) -> Option<usize> {
        self.document_config.as_ref().map(|c| c.sections.len())
    }

    pub fn collaborator(&self, id: &str) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| c.id == id)
    }

    pub fn signature(&self, field_id: &str) -> Option<&SignatureRecord> {
        self.signatures.get(field_id)
    }
}
