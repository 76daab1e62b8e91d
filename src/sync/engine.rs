//! Sync engine: session identity, pending queue, classification and retry.
//!
//! The engine owns one transport and drives it through a small state machine:
//!
//! ```text
//!  idle --connect--> connected --closed--> retrying --ok--> connected
//!                        ^                    |
//!                        +------flush---------+--budget spent--> failed
//! ```
//!
//! Retries use a fixed delay and a bounded budget. Outbound updates made
//! while disconnected, or whose send fails, wait in a FIFO queue that a
//! periodic flush drains once connected. Every connect or disconnect bumps a
//! generation counter; background work holding an older generation is inert.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::events::{EventBus, EventKind, ListenerId, SyncEvent};
use super::protocol::{
    Envelope, ParticipantRole, Payload, ProtocolError, SessionIdentity, SyncProtocol,
};
use super::transport::{build_transport, Transport, TransportEvent, TransportKind};
use super::{
    now_millis, FieldId, FormData, ParticipantId, SessionId, SyncConfig, SyncError, SyncResult,
};
use crate::workflow::WorkflowStep;

/// Result of handing an update to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Delivered to the transport
    Sent,
    /// Held in the pending queue for the next flush
    Queued,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Transport is up and the pump is running
    pub is_connected: bool,
    /// Session of the last `connect`, kept across disconnects
    pub session_id: Option<SessionId>,
    pub user_id: Option<ParticipantId>,
    pub user_role: Option<ParticipantRole>,
    /// Reconnect attempts made since the last successful connect
    pub retry_count: u32,
    /// Updates waiting for the next flush
    pub pending_updates: usize,
    /// Highest timestamp of any accepted remote envelope
    pub last_sync_timestamp: Option<i64>,
    pub transport: TransportKind,
}

/// An outbound update waiting for the transport. Identity is attached at
/// send time so queued work always goes out under the current session.
#[derive(Debug, Clone)]
struct PendingUpdate {
    timestamp: i64,
    payload: Payload,
}

#[derive(Default)]
struct EngineState {
    identity: Option<SessionIdentity>,
    is_connected: bool,
    retry_count: u32,
    /// Retry budget spent; nothing reconnects until the next `connect`
    exhausted: bool,
    /// FIFO of outbound updates not yet accepted by the transport
    pending: VecDeque<PendingUpdate>,
    last_sync_timestamp: Option<i64>,
    /// Last timestamp handed out by `next_timestamp`
    last_stamp: i64,
    /// Bumped by every connect and disconnect
    generation: u64,
    flush_task: Option<JoinHandle<()>>,
    /// Reads transport events into the classifier
    pump_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl EngineState {
    /// Wall clock, forced strictly increasing per engine
    fn next_timestamp(&mut self) -> i64 {
        self.last_stamp = now_millis().max(self.last_stamp + 1);
        self.last_stamp
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.flush_task.take(),
            self.pump_task.take(),
            self.retry_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

enum RetryStep {
    Attempt(u32),
    Exhausted(u32),
    Stop,
}

struct EngineInner {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    events: EventBus,
    state: Mutex<EngineState>,
}

/// Handle to a sync engine. Clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                events: EventBus::new(),
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Build the engine with the transport named by `config`
    pub fn from_config(config: SyncConfig) -> SyncResult<Self> {
        let transport = build_transport(&config)?;
        Ok(Self::new(transport, config))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().is_connected
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Join a session. Resets the retry budget.
    ///
    /// Updates queued before the first connect are kept and flushed into the
    /// session joined. Switching to a different session discards whatever
    /// is still queued for the previous one.
    ///
    /// On failure the error is returned and reconnect attempts continue in
    /// the background until the budget is spent.
    pub async fn connect(
        &self,
        session_id: impl Into<SessionId>,
        user_id: impl Into<ParticipantId>,
        role: ParticipantRole,
    ) -> SyncResult<()> {
        let identity = SessionIdentity::new(session_id, user_id, role);
        let generation = {
            let mut state = self.inner.state.lock();
            if state.is_connected && state.identity.as_ref() == Some(&identity) {
                debug!("Already connected to session {}", identity.session_id);
                return Ok(());
            }
            state.abort_tasks();
            state.is_connected = false;
            state.generation += 1;
            state.retry_count = 0;
            state.exhausted = false;
            let previous = state.identity.replace(identity);
            // Edits made for another session must not leak into this one
            if let Some(previous) = previous {
                let current = state.identity.as_ref().map(|i| i.session_id.as_str());
                if current != Some(previous.session_id.as_str()) && !state.pending.is_empty() {
                    info!(
                        "Discarding {} pending updates from session {}",
                        state.pending.len(),
                        previous.session_id
                    );
                    state.pending.clear();
                }
            }
            state.generation
        };

        match self.attempt(generation).await {
            Ok(()) => Ok(()),
            Err(SyncError::Superseded) => Err(SyncError::Superseded),
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.start_retry(generation);
                Err(e)
            }
        }
    }

    /// Leave the session. Stops the flush timer and any pending reconnect.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let (was_connected, identity) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.abort_tasks();
            state.retry_count = 0;
            let was_connected = std::mem::replace(&mut state.is_connected, false);
            (was_connected, state.identity.clone())
        };

        if was_connected {
            if let Some(identity) = &identity {
                self.announce(identity, Payload::UserLeft).await;
            }
        }
        self.inner.transport.disconnect().await;

        if was_connected {
            info!("Disconnected from session");
            self.inner
                .events
                .emit(&SyncEvent::Disconnected { reason: None });
        }
    }

    async fn attempt(&self, generation: u64) -> SyncResult<()> {
        let identity = {
            let state = self.inner.state.lock();
            if state.generation != generation {
                return Err(SyncError::Superseded);
            }
            state
                .identity
                .clone()
                .ok_or_else(|| SyncError::InvalidState("no session identity".to_string()))?
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let timeout = self.inner.config.connect_timeout;
        match tokio::time::timeout(timeout, self.inner.transport.connect(&identity, inbound_tx))
            .await
        {
            Err(_) => return Err(SyncError::ConnectTimeout(timeout)),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(())) => {}
        }

        if !self.mark_connected(generation, inbound_rx) {
            self.inner.transport.disconnect().await;
            return Err(SyncError::Superseded);
        }

        info!(
            "Connected to session {} as {} ({}) over {}",
            identity.session_id,
            identity.user_id,
            identity.role,
            self.inner.transport.kind()
        );
        self.inner.events.emit(&SyncEvent::Connected {
            session_id: identity.session_id.clone(),
        });
        self.announce(&identity, Payload::UserJoined).await;
        Ok(())
    }

    fn mark_connected(
        &self,
        generation: u64,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> bool {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return false;
        }
        state.is_connected = true;
        state.retry_count = 0;
        state.exhausted = false;

        let pump = tokio::spawn(self.clone().pump(generation, inbound));
        if let Some(old) = state.pump_task.replace(pump) {
            old.abort();
        }
        let flush = tokio::spawn(self.clone().flush_loop(generation));
        if let Some(old) = state.flush_task.replace(flush) {
            old.abort();
        }
        true
    }

    fn handle_closed(&self, generation: u64, reason: Option<String>) {
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation || !state.is_connected {
                return;
            }
            state.is_connected = false;
            if let Some(flush) = state.flush_task.take() {
                flush.abort();
            }
            // The pump is the caller; let it finish on its own
            state.pump_task = None;
        }

        warn!(
            "Connection lost: {}",
            reason.as_deref().unwrap_or("transport closed")
        );
        self.inner.events.emit(&SyncEvent::Disconnected { reason });
        self.start_retry(generation);
    }

    fn start_retry(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return;
        }
        let task = tokio::spawn(self.clone().retry_loop(generation));
        if let Some(old) = state.retry_task.replace(task) {
            old.abort();
        }
    }

    async fn retry_loop(self, generation: u64) {
        let max_retries = self.inner.config.max_retries;
        let delay = self.inner.config.retry_delay;

        loop {
            let step = {
                let mut state = self.inner.state.lock();
                if state.generation != generation || state.is_connected {
                    RetryStep::Stop
                } else if state.retry_count >= max_retries {
                    if state.exhausted {
                        RetryStep::Stop
                    } else {
                        state.exhausted = true;
                        RetryStep::Exhausted(state.retry_count)
                    }
                } else {
                    state.retry_count += 1;
                    RetryStep::Attempt(state.retry_count)
                }
            };

            match step {
                RetryStep::Stop => return,
                RetryStep::Exhausted(attempts) => {
                    error!("Giving up after {} reconnect attempts", attempts);
                    self.inner
                        .events
                        .emit(&SyncEvent::MaxRetriesReached { attempts });
                    return;
                }
                RetryStep::Attempt(n) => {
                    info!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        delay, n, max_retries
                    );
                    tokio::time::sleep(delay).await;
                    match self.attempt(generation).await {
                        Ok(()) | Err(SyncError::Superseded) => return,
                        Err(e) => warn!("Reconnect attempt {} failed: {}", n, e),
                    }
                }
            }
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn pump(self, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        let reason = loop {
            match inbound.recv().await {
                Some(TransportEvent::Message(value)) => self.classify(value),
                Some(TransportEvent::Closed { reason }) => break reason,
                None => break None,
            }
        };
        self.handle_closed(generation, reason);
    }

    fn classify(&self, value: serde_json::Value) {
        let envelope = match SyncProtocol::decode_value(value) {
            Ok(envelope) => envelope,
            Err(ProtocolError::UnknownMessageType(kind)) => {
                warn!("Ignoring envelope with unknown type {}", kind);
                return;
            }
            Err(e) => {
                warn!("Ignoring malformed envelope: {}", e);
                return;
            }
        };

        {
            let mut state = self.inner.state.lock();
            let Some(identity) = state.identity.as_ref() else {
                return;
            };
            if envelope.user_id == identity.user_id {
                return;
            }
            if envelope.session_id != identity.session_id {
                warn!(
                    "Ignoring envelope for session {} while in {}",
                    envelope.session_id, identity.session_id
                );
                return;
            }
            if state
                .last_sync_timestamp
                .map_or(true, |last| envelope.timestamp > last)
            {
                state.last_sync_timestamp = Some(envelope.timestamp);
            }
        }

        debug!(
            "Received {} from {} ({})",
            envelope.kind(),
            envelope.user_id,
            envelope.user_role
        );
        self.inner.events.emit(&SyncEvent::from(envelope));
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Broadcast form values. `field_id` marks a single-field edit.
    pub async fn sync_form_data(&self, form_data: FormData, field_id: Option<FieldId>) -> SyncOutcome {
        self.submit(Payload::FormUpdate {
            form_data,
            field_id,
        })
        .await
    }

    pub async fn sync_signature(
        &self,
        field_id: impl Into<FieldId>,
        signature: impl Into<String>,
        signed_by: impl Into<String>,
    ) -> SyncOutcome {
        self.submit(Payload::SignatureUpdate {
            field_id: field_id.into(),
            signature: signature.into(),
            signed_by: signed_by.into(),
        })
        .await
    }

    pub async fn sync_workflow_status(
        &self,
        status: impl Into<String>,
        step: WorkflowStep,
    ) -> SyncOutcome {
        self.submit(Payload::WorkflowStatus {
            status: status.into(),
            step,
        })
        .await
    }

    async fn submit(&self, payload: Payload) -> SyncOutcome {
        let kind = payload.kind();
        let (envelope, update) = {
            let mut state = self.inner.state.lock();
            let update = PendingUpdate {
                timestamp: state.next_timestamp(),
                payload,
            };
            let identity = if state.is_connected {
                state.identity.clone()
            } else {
                None
            };
            let Some(identity) = identity else {
                debug!("Not connected, queueing {}", kind);
                state.pending.push_back(update);
                return SyncOutcome::Queued;
            };
            (identity.envelope(update.timestamp, update.payload.clone()), update)
        };

        match self.inner.transport.send(&envelope).await {
            Ok(()) => {
                debug!("Sent {} at {}", kind, envelope.timestamp);
                SyncOutcome::Sent
            }
            Err(e) => {
                warn!("Send of {} failed, queueing: {}", kind, e);
                self.inner.state.lock().pending.push_back(update);
                SyncOutcome::Queued
            }
        }
    }

    /// Drain the pending queue through the transport. Updates that fail go
    /// back to the tail. Returns how many were sent.
    pub async fn flush_pending(&self) -> usize {
        let (identity, batch) = {
            let mut state = self.inner.state.lock();
            if !state.is_connected || state.pending.is_empty() {
                return 0;
            }
            let Some(identity) = state.identity.clone() else {
                return 0;
            };
            let batch: Vec<PendingUpdate> = state.pending.drain(..).collect();
            (identity, batch)
        };

        let mut sent = 0;
        for update in batch {
            let envelope = identity.envelope(update.timestamp, update.payload.clone());
            match self.inner.transport.send(&envelope).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!("Flush of {} failed: {}", envelope.kind(), e);
                    self.inner.state.lock().pending.push_back(update);
                }
            }
        }

        if sent > 0 {
            debug!("Flushed {} pending updates", sent);
        }
        sent
    }

    async fn flush_loop(self, generation: u64) {
        let period = self.inner.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.inner.state.lock().generation != generation {
                return;
            }
            self.flush_pending().await;
        }
    }

    /// Presence is best-effort and never queued
    async fn announce(&self, identity: &SessionIdentity, payload: Payload) {
        let kind = payload.kind();
        let envelope: Envelope = {
            let mut state = self.inner.state.lock();
            identity.envelope(state.next_timestamp(), payload)
        };
        if let Err(e) = self.inner.transport.send(&envelope).await {
            debug!("Could not announce {}: {}", kind, e);
        }
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.inner.state.lock();
        SyncStatus {
            is_connected: state.is_connected,
            session_id: state.identity.as_ref().map(|i| i.session_id.clone()),
            user_id: state.identity.as_ref().map(|i| i.user_id.clone()),
            user_role: state.identity.as_ref().map(|i| i.role),
            retry_count: state.retry_count,
            pending_updates: state.pending.len(),
            last_sync_timestamp: state.last_sync_timestamp,
            transport: self.inner.transport.kind(),
        }
    }
}
