//! Per-session relay rooms.
//!
//! A room keeps the live WebSocket peers of one session and a bounded history
//! of every envelope relayed through it, which is what polling clients read.
//! Rooms are created on first use and removed by the cleanup task once they
//! have been empty for the idle timeout.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sync::protocol::{Envelope, ParticipantRole, Payload, PollResponse, SyncProtocol};
use crate::sync::{now_millis, ParticipantId, SessionId};

/// Identifies one WebSocket connection
pub type ConnectionId = u64;

/// A connected WebSocket peer
pub struct RoomPeer {
    /// Participant the connection was opened for
    pub user_id: ParticipantId,
    /// Role announced in the connect query
    pub role: ParticipantRole,
    /// Encoded frames waiting for the socket writer
    tx: mpsc::UnboundedSender<String>,
}

impl RoomPeer {
    pub fn new(
        user_id: impl Into<ParticipantId>,
        role: ParticipantRole,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            tx,
        }
    }
}

/// Relayed envelopes, each tagged with the room sequence it was assigned
struct History {
    entries: VecDeque<(u64, Envelope)>,
    last_seq: u64,
}

/// One session's relay state
pub struct SessionRoom {
    session_id: SessionId,
    /// Live WebSocket connections
    peers: DashMap<ConnectionId, RoomPeer>,
    history: Mutex<History>,
    /// Oldest envelopes are dropped past this many
    max_history: usize,
    /// Last join, leave or publish; drives idle removal
    last_active: Mutex<Instant>,
}

impl SessionRoom {
    fn new(session_id: impl Into<SessionId>, max_history: usize) -> Self {
        Self {
            session_id: session_id.into(),
            peers: DashMap::new(),
            history: Mutex::new(History {
                entries: VecDeque::new(),
                last_seq: 0,
            }),
            max_history: max_history.max(1),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a live connection. Frames published afterwards reach it.
    pub fn join(&self, connection_id: ConnectionId, peer: RoomPeer) {
        debug!(
            "Connection {} ({}) joined room {}",
            connection_id, peer.user_id, self.session_id
        );
        self.peers.insert(connection_id, peer);
        self.touch();
    }

    /// Remove a connection, returning its peer if it was still registered
    pub fn leave(&self, connection_id: ConnectionId) -> Option<RoomPeer> {
        self.touch();
        self.peers.remove(&connection_id).map(|(_, peer)| peer)
    }

    /// Whether `user_id` still has a live connection here
    pub fn has_user(&self, user_id: &str) -> bool {
        self.peers.iter().any(|peer| peer.user_id == user_id)
    }

    /// Record an envelope and fan it out to every WebSocket peer other than
    /// the sender. Returns how many peers it was handed to.
    pub fn publish(&self, envelope: Envelope) -> usize {
        self.touch();
        let text = match SyncProtocol::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Not relaying envelope in {}: {}", self.session_id, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.peers.iter() {
            if peer.user_id == envelope.user_id {
                continue;
            }
            if peer.tx.send(text.clone()).is_ok() {
                delivered += 1;
            }
        }

        let mut history = self.history.lock();
        history.last_seq += 1;
        let seq = history.last_seq;
        history.entries.push_back((seq, envelope));
        while history.entries.len() > self.max_history {
            history.entries.pop_front();
        }
        delivered
    }

    /// History in arrival order, optionally only envelopes stamped after `since`
    pub fn updates_since(&self, since: Option<i64>) -> Vec<Envelope> {
        self.poll(None, since).updates
    }

    /// Envelopes relayed after sequence `after`, in arrival order, together
    /// with the newest sequence. `since` additionally filters by timestamp
    /// for clients that do not track the cursor.
    pub fn poll(&self, after: Option<u64>, since: Option<i64>) -> PollResponse<Envelope> {
        let history = self.history.lock();
        // A cursor from before the room was recreated starts over
        let after = after.filter(|after| *after <= history.last_seq).unwrap_or(0);
        let updates = history
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .filter(|(_, e)| since.map_or(true, |since| e.timestamp > since))
            .map(|(_, e)| e.clone())
            .collect();
        PollResponse {
            updates,
            cursor: Some(history.last_seq),
        }
    }

    /// `user_joined` envelopes for everyone currently in the session except
    /// `except`, so a newcomer can build its roster. Live peers whose join
    /// fell out of history get a join stamped now.
    pub fn presence(&self, except: &str) -> Vec<Envelope> {
        let mut present = {
            let history = self.history.lock();
            SyncProtocol::presence_replay(history.entries.iter().map(|(_, e)| e), except)
        };
        for peer in self.peers.iter() {
            if peer.user_id == except || present.iter().any(|e| e.user_id == peer.user_id) {
                continue;
            }
            present.push(Envelope {
                session_id: self.session_id.clone(),
                user_id: peer.user_id.clone(),
                user_role: peer.role,
                timestamp: now_millis(),
                payload: Payload::UserJoined,
            });
        }
        present
    }

    /// Number of live WebSocket connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().entries.len()
    }

    /// True once the room has had no peers and no traffic for `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.peers.is_empty() && self.last_active.lock().elapsed() > timeout
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

/// All live rooms, keyed by session id
pub struct RoomRegistry {
    rooms: DashMap<SessionId, Arc<SessionRoom>>,
    /// History bound handed to every new room
    max_history: usize,
    next_connection: AtomicU64,
}

impl RoomRegistry {
    /// Registry whose rooms keep at most `max_history` envelopes each
    pub fn new(max_history: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_history,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<SessionRoom> {
        self.rooms
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Opened room for session {}", session_id);
                Arc::new(SessionRoom::new(session_id, self.max_history))
            })
            .value()
            .clone()
    }

    /// Existing room, without creating one
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRoom>> {
        self.rooms.get(session_id).map(|room| room.value().clone())
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop rooms that have had no peers for longer than `timeout`
    pub fn remove_idle(&self, timeout: Duration) -> usize {
        let candidates: Vec<SessionId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_idle(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in candidates {
            if self
                .rooms
                .remove_if(&session_id, |_, room| room.is_idle(timeout))
                .is_some()
            {
                info!("Removed idle room: {}", session_id);
                removed += 1;
            }
        }
        removed
    }

    /// Number of open rooms
    pub fn session_count(&self) -> usize {
        self.rooms.len()
    }

    /// Live connections across every room
    pub fn peer_count(&self) -> usize {
        self.rooms.iter().map(|room| room.peer_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(user_id: &str, timestamp: i64) -> Envelope {
        Envelope {
            session_id: "session-1".to_string(),
            user_id: user_id.to_string(),
            user_role: ParticipantRole::Client,
            timestamp,
            payload: Payload::UserJoined,
        }
    }

    fn peer(room: &SessionRoom, id: ConnectionId, user_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.join(id, RoomPeer::new(user_id, ParticipantRole::Notary, tx));
        rx
    }

    #[test]
    fn test_publish_skips_sender() {
        let room = SessionRoom::new("session-1", 10);
        let mut alice = peer(&room, 1, "alice");
        let mut bob = peer(&room, 2, "bob");

        assert_eq!(room.publish(envelope("alice", 1)), 1);

        let frame = bob.try_recv().unwrap();
        assert_eq!(SyncProtocol::decode(&frame).unwrap(), envelope("alice", 1));
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let room = SessionRoom::new("session-1", 3);
        for ts in 1..=5 {
            room.publish(envelope("alice", ts));
        }

        let timestamps: Vec<i64> = room.updates_since(None).iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![3, 4, 5]);
        assert_eq!(room.history_len(), 3);
    }

    #[test]
    fn test_updates_since_filters() {
        let room = SessionRoom::new("session-1", 10);
        for ts in [10, 20, 30] {
            room.publish(envelope("alice", ts));
        }
        let timestamps: Vec<i64> = room
            .updates_since(Some(15))
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(timestamps, vec![20, 30]);
        assert!(room.updates_since(Some(30)).is_empty());
    }

    #[test]
    fn test_poll_cursor_returns_only_newer_sequences() {
        let room = SessionRoom::new("session-1", 10);
        let empty = room.poll(None, None);
        assert!(empty.updates.is_empty());
        assert_eq!(empty.cursor, Some(0));

        // Arrival order, not timestamp order, decides what is new.
        room.publish(envelope("alice", 500));
        let first = room.poll(None, None);
        assert_eq!(first.cursor, Some(1));

        room.publish(envelope("bob", 100));
        room.publish(envelope("carol", 300));
        let next = room.poll(first.cursor, None);
        let senders: Vec<&str> = next.updates.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(senders, vec!["bob", "carol"]);
        assert_eq!(next.cursor, Some(3));
        assert!(room.poll(next.cursor, None).updates.is_empty());
        assert_eq!(room.poll(Some(99), None).updates.len(), 3);
    }

    #[test]
    fn test_poll_cursor_survives_history_trim() {
        let room = SessionRoom::new("session-1", 2);
        for ts in 1..=4 {
            room.publish(envelope("alice", ts));
        }
        let response = room.poll(Some(1), None);
        let timestamps: Vec<i64> = response.updates.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![3, 4]);
        assert_eq!(response.cursor, Some(4));
    }

    #[test]
    fn test_presence_lists_other_participants() {
        let room = SessionRoom::new("session-1", 10);
        room.publish(envelope("alice", 10));
        room.publish(envelope("bob", 20));
        room.publish(Envelope {
            payload: Payload::UserLeft,
            ..envelope("bob", 30)
        });
        // Live without a join in history
        let _dave = peer(&room, 7, "dave");

        let present = room.presence("carol");
        let users: Vec<&str> = present.iter().map(|e| e.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "dave"]);
        assert_eq!(present[0].timestamp, 10);
        assert!(present.iter().all(|e| e.payload == Payload::UserJoined));
        assert!(room.presence("alice").iter().all(|e| e.user_id != "alice"));
    }

    #[test]
    fn test_leave_and_has_user() {
        let room = SessionRoom::new("session-1", 10);
        let _first = peer(&room, 1, "alice");
        let _second = peer(&room, 2, "alice");

        room.leave(1);
        assert!(room.has_user("alice"));
        room.leave(2);
        assert!(!room.has_user("alice"));
        assert_eq!(room.peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_rooms_are_removed() {
        let registry = RoomRegistry::new(10);
        let idle = registry.get_or_create("idle");
        let busy = registry.get_or_create("busy");
        let _rx = peer(&busy, registry.next_connection_id(), "alice");
        drop(idle);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(registry.remove_idle(Duration::from_secs(300)), 1);
        assert!(registry.get("idle").is_none());
        assert!(registry.get("busy").is_some());
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_get_or_create_reuses_room() {
        let registry = RoomRegistry::new(10);
        let first = registry.get_or_create("session-1");
        first.publish(envelope("alice", 1));

        let second = registry.get_or_create("session-1");
        assert_eq!(second.history_len(), 1);
        assert_eq!(registry.session_count(), 1);
        assert_ne!(registry.next_connection_id(), registry.next_connection_id());
    }
}
