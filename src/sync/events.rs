//! Typed event surface of the sync engine.
//!
//! Remote envelopes are classified into one event per change type. Listeners
//! are plain callbacks registered per [`EventKind`]; emission is synchronous
//! and a panicking listener never prevents the others from running.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use super::protocol::{Envelope, ParticipantRole, Payload};
use super::{FieldId, FormData, ParticipantId, SessionId};
use crate::workflow::WorkflowStep;

/// Sender metadata carried by every remote event
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub user_id: ParticipantId,
    pub role: ParticipantRole,
    pub timestamp: i64,
}

/// Events delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    FormUpdate {
        origin: Origin,
        form_data: FormData,
        field_id: Option<FieldId>,
    },
    SignatureUpdate {
        origin: Origin,
        field_id: FieldId,
        signature: String,
        signed_by: String,
    },
    WorkflowStatusUpdate {
        origin: Origin,
        status: String,
        step: WorkflowStep,
    },
    UserJoined {
        origin: Origin,
    },
    UserLeft {
        origin: Origin,
    },
    Connected {
        session_id: SessionId,
    },
    Disconnected {
        reason: Option<String>,
    },
    MaxRetriesReached {
        attempts: u32,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::FormUpdate { .. } => EventKind::FormUpdate,
            SyncEvent::SignatureUpdate { .. } => EventKind::SignatureUpdate,
            SyncEvent::WorkflowStatusUpdate { .. } => EventKind::WorkflowStatusUpdate,
            SyncEvent::UserJoined { .. } => EventKind::UserJoined,
            SyncEvent::UserLeft { .. } => EventKind::UserLeft,
            SyncEvent::Connected { .. } => EventKind::Connected,
            SyncEvent::Disconnected { .. } => EventKind::Disconnected,
            SyncEvent::MaxRetriesReached { .. } => EventKind::MaxRetriesReached,
        }
    }
}

impl From<Envelope> for SyncEvent {
    fn from(envelope: Envelope) -> Self {
        let origin = Origin {
            user_id: envelope.user_id,
            role: envelope.user_role,
            timestamp: envelope.timestamp,
        };
        match envelope.payload {
            Payload::FormUpdate {
                form_data,
                field_id,
            } => SyncEvent::FormUpdate {
                origin,
                form_data,
                field_id,
            },
            Payload::SignatureUpdate {
                field_id,
                signature,
                signed_by,
            } => SyncEvent::SignatureUpdate {
                origin,
                field_id,
                signature,
                signed_by,
            },
            Payload::WorkflowStatus { status, step } => SyncEvent::WorkflowStatusUpdate {
                origin,
                status,
                step,
            },
            Payload::UserJoined => SyncEvent::UserJoined { origin },
            Payload::UserLeft => SyncEvent::UserLeft { origin },
        }
    }
}

/// Event names listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FormUpdate,
    SignatureUpdate,
    WorkflowStatusUpdate,
    UserJoined,
    UserLeft,
    Connected,
    Disconnected,
    MaxRetriesReached,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::FormUpdate,
        EventKind::SignatureUpdate,
        EventKind::WorkflowStatusUpdate,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::MaxRetriesReached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FormUpdate => "formUpdate",
            EventKind::SignatureUpdate => "signatureUpdate",
            EventKind::WorkflowStatusUpdate => "workflowStatusUpdate",
            EventKind::UserJoined => "userJoined",
            EventKind::UserLeft => "userLeft",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::MaxRetriesReached => "maxRetriesReached",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Per-kind listener registry
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        before != entries.len()
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// The registry lock is released before callbacks run, so listeners may
    /// subscribe or unsubscribe from inside a callback. Returns the number of
    /// listeners that completed without panicking.
    pub fn emit(&self, event: &SyncEvent) -> usize {
        let kind = event.kind();
        let listeners: Vec<Listener> = match self.listeners.read().get(&kind) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!("Listener for {} panicked: {}", kind, panic_message(&*panic));
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn connected() -> SyncEvent {
        SyncEvent::Connected {
            session_id: "session-1".to_string(),
        }
    }

    #[test]
    fn test_listeners_by_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        bus.on(EventKind::Connected, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(&connected()), 1);
        assert_eq!(bus.emit(&SyncEvent::Disconnected { reason: None }), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::Connected, |_| panic!("listener failure"));
        let h = hits.clone();
        bus.on(EventKind::Connected, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.emit(&connected()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::UserLeft, |_| {});

        assert_eq!(bus.listener_count(EventKind::UserLeft), 1);
        assert!(bus.off(EventKind::UserLeft, id));
        assert!(!bus.off(EventKind::UserLeft, id));
        assert_eq!(bus.listener_count(EventKind::UserLeft), 0);
    }

    #[test]
    fn test_event_from_envelope() {
        let envelope = Envelope {
            session_id: "session-1".to_string(),
            user_id: "u-notary".to_string(),
            user_role: ParticipantRole::Notary,
            timestamp: 10,
            payload: Payload::UserJoined,
        };

        match SyncEvent::from(envelope) {
            SyncEvent::UserJoined { origin } => {
                assert_eq!(origin.user_id, "u-notary");
                assert_eq!(origin.role, ParticipantRole::Notary);
                assert_eq!(origin.timestamp, 10);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
