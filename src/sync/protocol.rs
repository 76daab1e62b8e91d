//! JSON wire protocol for workflow synchronization.
//!
//! Every message is one JSON object, the envelope, carrying the change type,
//! the sender identity and a sender-local millisecond timestamp. The same
//! shape travels over WebSocket text frames and HTTP polling bodies:
//!
//! ```json
//! {
//!   "type": "form_update",
//!   "sessionId": "3f2c...",
//!   "userId": "u-client",
//!   "userRole": "client",
//!   "timestamp": 1760000000000,
//!   "formData": { "fullName": "Alice" },
//!   "fieldId": "fullName"
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{FieldId, FormData, ParticipantId, SessionId};
use crate::workflow::WorkflowStep;

/// Maximum accepted size of an encoded envelope (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Message has no type tag")]
    MissingType,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Unknown participant role: {0}")]
    UnknownRole(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Role a participant plays in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Client,
    Notary,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Client => "client",
            ParticipantRole::Notary => "notary",
        }
    }

    /// Human-readable label used in notifications
    pub fn label(&self) -> &'static str {
        match self {
            ParticipantRole::Client => "Client",
            ParticipantRole::Notary => "Notary",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantRole {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(ParticipantRole::Client),
            "notary" => Ok(ParticipantRole::Notary),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// Envelope discriminator as it appears in the `type` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    FormUpdate,
    SignatureUpdate,
    WorkflowStatus,
    UserJoined,
    UserLeft,
}

impl EnvelopeType {
    pub const ALL: [EnvelopeType; 5] = [
        EnvelopeType::FormUpdate,
        EnvelopeType::SignatureUpdate,
        EnvelopeType::WorkflowStatus,
        EnvelopeType::UserJoined,
        EnvelopeType::UserLeft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::FormUpdate => "form_update",
            EnvelopeType::SignatureUpdate => "signature_update",
            EnvelopeType::WorkflowStatus => "workflow_status",
            EnvelopeType::UserJoined => "user_joined",
            EnvelopeType::UserLeft => "user_left",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific body of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Form values. `field_id` names the single edited field for incremental
    /// edits and is absent for bulk syncs.
    #[serde(rename_all = "camelCase")]
    FormUpdate {
        form_data: FormData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field_id: Option<FieldId>,
    },

    #[serde(rename_all = "camelCase")]
    SignatureUpdate {
        field_id: FieldId,
        signature: String,
        signed_by: String,
    },

    WorkflowStatus {
        status: String,
        step: WorkflowStep,
    },

    UserJoined,

    UserLeft,
}

impl Payload {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Payload::FormUpdate { .. } => EnvelopeType::FormUpdate,
            Payload::SignatureUpdate { .. } => EnvelopeType::SignatureUpdate,
            Payload::WorkflowStatus { .. } => EnvelopeType::WorkflowStatus,
            Payload::UserJoined => EnvelopeType::UserJoined,
            Payload::UserLeft => EnvelopeType::UserLeft,
        }
    }
}

/// The unit of exchange between participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub session_id: SessionId,
    pub user_id: ParticipantId,
    pub user_role: ParticipantRole,
    /// Sender-local milliseconds since the epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeType {
        self.payload.kind()
    }
}

/// Who this engine speaks as in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub user_id: ParticipantId,
    pub role: ParticipantRole,
}

impl SessionIdentity {
    pub fn new(
        session_id: impl Into<SessionId>,
        user_id: impl Into<ParticipantId>,
        role: ParticipantRole,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            role,
        }
    }

    /// Wrap a payload with this identity
    pub fn envelope(&self, timestamp: i64, payload: Payload) -> Envelope {
        Envelope {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            user_role: self.role,
            timestamp,
            payload,
        }
    }
}

/// Body returned by the polling endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse<T = Value> {
    #[serde(default = "Vec::new")]
    pub updates: Vec<T>,
    /// Relay sequence of the newest update in the session. Sent back as
    /// `?after=` so the next poll returns only what arrived since.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}

/// Protocol encoder/decoder
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode an envelope as a JSON text frame
    pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(envelope)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(text)
    }

    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))?;
        Self::decode_value(value)
    }

    /// The latest `user_joined` of every participant still present in
    /// `history`, oldest join first. A later `user_left` removes the
    /// participant. `except` is left out, so a newcomer is not told about
    /// itself.
    pub fn presence_replay<'a, I>(history: I, except: &str) -> Vec<Envelope>
    where
        I: IntoIterator<Item = &'a Envelope>,
    {
        let mut present: Vec<Envelope> = Vec::new();
        for envelope in history {
            if envelope.user_id == except {
                continue;
            }
            match envelope.payload {
                Payload::UserJoined => {
                    present.retain(|e| e.user_id != envelope.user_id);
                    present.push(envelope.clone());
                }
                Payload::UserLeft => present.retain(|e| e.user_id != envelope.user_id),
                _ => {}
            }
        }
        present
    }

    /// Decode an already-parsed JSON value.
    ///
    /// Unknown `type` tags are reported separately from malformed bodies so
    /// that receivers can skip envelopes from newer peers.
    pub fn decode_value(value: Value) -> Result<Envelope, ProtocolError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if EnvelopeType::parse(tag).is_none() {
            return Err(ProtocolError::UnknownMessageType(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("session-1", "u-client", ParticipantRole::Client)
    }

    #[test]
    fn test_form_update_wire_shape() {
        let mut form_data = FormData::new();
        form_data.insert("fullName".to_string(), json!("Alice"));

        let envelope = identity().envelope(
            1000,
            Payload::FormUpdate {
                form_data,
                field_id: Some("fullName".to_string()),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "form_update",
                "sessionId": "session-1",
                "userId": "u-client",
                "userRole": "client",
                "timestamp": 1000,
                "formData": { "fullName": "Alice" },
                "fieldId": "fullName"
            })
        );
    }

    #[test]
    fn test_bulk_form_update_omits_field_id() {
        let envelope = identity().envelope(
            5,
            Payload::FormUpdate {
                form_data: FormData::new(),
                field_id: None,
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("fieldId").is_none());
        assert_eq!(value["formData"], json!({}));
    }

    #[test]
    fn test_decode_signature_update() {
        let text = r#"{
            "type": "signature_update",
            "sessionId": "session-1",
            "userId": "u-notary",
            "userRole": "notary",
            "timestamp": 42,
            "fieldId": "clientSignature",
            "signature": "data:image/png;base64,AAAA",
            "signedBy": "notary"
        }"#;

        let envelope = SyncProtocol::decode(text).unwrap();
        assert_eq!(envelope.user_role, ParticipantRole::Notary);
        assert_eq!(envelope.kind(), EnvelopeType::SignatureUpdate);
        match envelope.payload {
            Payload::SignatureUpdate {
                field_id,
                signed_by,
                ..
            } => {
                assert_eq!(field_id, "clientSignature");
                assert_eq!(signed_by, "notary");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_decode_presence_without_body() {
        let value = json!({
            "type": "user_joined",
            "sessionId": "session-1",
            "userId": "u-notary",
            "userRole": "notary",
            "timestamp": 7
        });

        let envelope = SyncProtocol::decode_value(value).unwrap();
        assert_eq!(envelope.payload, Payload::UserJoined);
    }

    #[test]
    fn test_decode_workflow_status_step() {
        let value = json!({
            "type": "workflow_status",
            "sessionId": "session-1",
            "userId": "u-notary",
            "userRole": "notary",
            "timestamp": 9,
            "status": "in_review",
            "step": "document_signing"
        });

        let envelope = SyncProtocol::decode_value(value).unwrap();
        assert_eq!(
            envelope.payload,
            Payload::WorkflowStatus {
                status: "in_review".to_string(),
                step: WorkflowStep::DocumentSigning,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let value = json!({
            "type": "cursor_move",
            "sessionId": "session-1",
            "userId": "u-notary",
            "userRole": "notary",
            "timestamp": 9
        });

        let result = SyncProtocol::decode_value(value);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(t)) if t == "cursor_move"));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(matches!(
            SyncProtocol::decode_value(json!({ "sessionId": "s" })),
            Err(ProtocolError::MissingType)
        ));

        // Known type, missing required fields
        assert!(matches!(
            SyncProtocol::decode_value(json!({ "type": "form_update", "userId": "u" })),
            Err(ProtocolError::InvalidFormat(_))
        ));

        assert!(matches!(
            SyncProtocol::decode("not json"),
            Err(ProtocolError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_participant_role_parse() {
        assert_eq!("notary".parse::<ParticipantRole>().unwrap(), ParticipantRole::Notary);
        assert!(matches!(
            "witness".parse::<ParticipantRole>(),
            Err(ProtocolError::UnknownRole(_))
        ));
        assert_eq!(ParticipantRole::Client.to_string(), "client");
    }

    #[test]
    fn test_poll_response_defaults_to_empty() {
        let body: PollResponse = serde_json::from_str("{}").unwrap();
        assert!(body.updates.is_empty());
        assert!(body.cursor.is_none());
    }

    #[test]
    fn test_presence_replay_tracks_joins_and_leaves() {
        let identity = |user: &str| SessionIdentity::new("s1", user, ParticipantRole::Notary);
        let history = vec![
            identity("alice").envelope(1, Payload::UserJoined),
            identity("bob").envelope(2, Payload::UserJoined),
            identity("carol").envelope(3, Payload::UserJoined),
            identity("bob").envelope(4, Payload::UserLeft),
            identity("alice").envelope(5, Payload::UserJoined),
            identity("dave").envelope(6, Payload::UserLeft),
        ];

        let replay = SyncProtocol::presence_replay(&history, "carol");
        let present: Vec<(&str, i64)> = replay
            .iter()
            .map(|e| (e.user_id.as_str(), e.timestamp))
            .collect();
        assert_eq!(present, vec![("alice", 5)]);
        assert!(replay.iter().all(|e| e.kind() == EnvelopeType::UserJoined));
    }
}
