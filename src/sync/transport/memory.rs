//! In-process transport.
//!
//! A [`MemoryHub`] plays the relay for engines living in the same process:
//! envelopes sent by one endpoint are delivered to every other endpoint in
//! the same session. Like the relay, a joining endpoint is first sent the
//! `user_joined` of everyone already present. The hub can be taken offline
//! to exercise queueing and reconnect paths without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{InboundSender, Transport, TransportError, TransportEvent, TransportKind};
use crate::sync::protocol::{Envelope, SessionIdentity, SyncProtocol};
use crate::sync::SessionId;

struct HubPeer {
    endpoint: u64,
    inbound: InboundSender,
}

struct HubInner {
    sessions: Mutex<HashMap<SessionId, Vec<HubPeer>>>,
    history: Mutex<Vec<Envelope>>,
    available: AtomicBool,
    connect_attempts: AtomicUsize,
    next_endpoint: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                next_endpoint: AtomicU64::new(1),
            }),
        }
    }

    /// Create a new endpoint on this hub
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            endpoint: self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed),
            session: Mutex::new(None),
        }
    }

    /// While unavailable, connects and sends fail
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Close every open endpoint as if the relay dropped them
    pub fn drop_connections(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        for peer in sessions.into_values().flatten() {
            let _ = peer.inbound.send(TransportEvent::Closed {
                reason: Some("hub dropped connection".to_string()),
            });
        }
    }

    /// Deliver a raw JSON value to every endpoint in a session, sender included
    pub fn inject(&self, session_id: &str, value: serde_json::Value) -> usize {
        let sessions = self.inner.sessions.lock();
        let Some(peers) = sessions.get(session_id) else {
            return 0;
        };
        peers
            .iter()
            .filter(|peer| peer.inbound.send(TransportEvent::Message(value.clone())).is_ok())
            .count()
    }

    /// Total connect calls made against this hub
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Joins of everyone present in `identity`'s session other than itself
    fn presence(&self, identity: &SessionIdentity) -> Vec<serde_json::Value> {
        let history = self.inner.history.lock();
        let in_session = history.iter().filter(|e| e.session_id == identity.session_id);
        SyncProtocol::presence_replay(in_session, &identity.user_id)
            .iter()
            .filter_map(|envelope| serde_json::to_value(envelope).ok())
            .collect()
    }

    /// Every envelope successfully sent through the hub, in order
    pub fn history(&self) -> Vec<Envelope> {
        self.inner.history.lock().clone()
    }

    pub fn peer_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map_or(0, Vec::len)
    }

    fn publish(&self, from: u64, envelope: &Envelope) -> Result<usize, TransportError> {
        let value = serde_json::to_value(envelope)?;
        self.inner.history.lock().push(envelope.clone());

        let mut sessions = self.inner.sessions.lock();
        let Some(peers) = sessions.get_mut(&envelope.session_id) else {
            return Ok(0);
        };
        peers.retain(|peer| !peer.inbound.is_closed());
        Ok(peers
            .iter()
            .filter(|peer| peer.endpoint != from)
            .filter(|peer| peer.inbound.send(TransportEvent::Message(value.clone())).is_ok())
            .count())
    }
}

/// One endpoint on a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    endpoint: u64,
    session: Mutex<Option<SessionId>>,
}

impl MemoryTransport {
    fn leave(&self) {
        let Some(session_id) = self.session.lock().take() else {
            return;
        };
        let mut sessions = self.hub.inner.sessions.lock();
        if let Some(peers) = sessions.get_mut(&session_id) {
            peers.retain(|peer| peer.endpoint != self.endpoint);
            if peers.is_empty() {
                sessions.remove(&session_id);
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn connect(
        &self,
        identity: &SessionIdentity,
        inbound: InboundSender,
    ) -> Result<(), TransportError> {
        self.hub.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.hub.is_available() {
            return Err(TransportError::Closed("memory hub unavailable".to_string()));
        }

        self.leave();
        for value in self.hub.presence(identity) {
            let _ = inbound.send(TransportEvent::Message(value));
        }
        self.hub
            .inner
            .sessions
            .lock()
            .entry(identity.session_id.clone())
            .or_default()
            .push(HubPeer {
                endpoint: self.endpoint,
                inbound,
            });
        *self.session.lock() = Some(identity.session_id.clone());
        debug!(
            "Memory endpoint {} joined session {}",
            self.endpoint, identity.session_id
        );
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.session.lock().is_none() {
            return Err(TransportError::NotConnected);
        }
        if !self.hub.is_available() {
            return Err(TransportError::Closed("memory hub unavailable".to_string()));
        }
        self.hub.publish(self.endpoint, envelope)?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.leave();
    }
}
