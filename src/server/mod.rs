//! Reference relay for workflow sync.
//!
//! Serves both transports the engine speaks:
//! - WebSocket at `/workflow/:session_id?userId=&role=`, relaying envelopes
//!   between the peers of a session
//! - HTTP polling at `/workflow/:session_id/sync`, appending with `POST` and
//!   reading the session history with `GET`. Every response carries the
//!   room's sequence cursor; `?after=<cursor>` returns only what the relay
//!   received since.
//!
//! Everything is held in memory. Rooms that stay empty past the idle timeout
//! are dropped by a background cleanup task.

mod room;

pub use room::{ConnectionId, RoomPeer, RoomRegistry, SessionRoom};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::sync::protocol::{Envelope, ParticipantRole, Payload, PollResponse, SyncProtocol};
use crate::sync::{env_parse, now_millis, ParticipantId, SessionId};

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Envelopes kept per session for polling clients
    pub max_history: usize,
    pub cleanup_interval: Duration,
    /// Empty rooms older than this are removed
    pub session_idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            max_history: 500,
            cleanup_interval: Duration::from_secs(60),
            session_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse("PORT") {
            config.port = port;
        }
        if let Some(max) = env_parse("RELAY_MAX_HISTORY") {
            config.max_history = max;
        }
        if let Some(secs) = env_parse("RELAY_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("RELAY_IDLE_TIMEOUT_SECS") {
            config.session_idle_timeout = Duration::from_secs(secs);
        }
        config
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared relay state
pub struct AppState {
    /// Every open session room
    rooms: RoomRegistry,
    config: RelayConfig,
    /// Reported as uptime by `/health`
    started_at: Instant,
    /// Fired once on shutdown; background loops subscribe to it
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            rooms: RoomRegistry::new(config.max_history),
            config,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop the background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Start the idle-room cleanup loop. It exits on [`AppState::shutdown`].
pub fn start_background_tasks(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.cleanup_interval);
        let mut shutdown = state.shutdown_receiver();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = state.rooms.remove_idle(state.config.session_idle_timeout);
                    if removed > 0 {
                        debug!("Cleanup removed {} idle rooms", removed);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Cleanup task shutting down");
                    break;
                }
            }
        }
    })
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/workflow/:session_id", get(ws_handler))
        .route(
            "/workflow/:session_id/sync",
            get(poll_updates).post(post_update),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_sessions: usize,
    active_peers: usize,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: state.rooms.session_count(),
        active_peers: state.rooms.peer_count(),
    })
}

#[derive(Debug, Deserialize)]
struct PollParams {
    /// Room sequence from the previous response
    after: Option<u64>,
    /// Timestamp filter for clients without a cursor
    since: Option<i64>,
}

type HandlerError = (StatusCode, String);

/// The caller named by `Authorization: Bearer <userId>`
fn bearer(headers: &HeaderMap) -> Result<ParticipantId, HandlerError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                "missing bearer token".to_string(),
            )
        })
}

async fn poll_updates(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Query(params): Query<PollParams>,
    headers: HeaderMap,
) -> Result<Json<PollResponse<Envelope>>, HandlerError> {
    let caller = bearer(&headers)?;
    let response = match state.rooms.get(&session_id) {
        Some(room) => room.poll(params.after, params.since),
        None => PollResponse {
            updates: Vec::new(),
            cursor: Some(0),
        },
    };
    debug!(
        "Poll from {} in {}: {} updates",
        caller,
        session_id,
        response.updates.len()
    );
    Ok(Json(response))
}

async fn post_update(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    headers: HeaderMap,
    Json(envelope): Json<Envelope>,
) -> Result<StatusCode, HandlerError> {
    let caller = bearer(&headers)?;
    if envelope.session_id != session_id {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "envelope is for session {}, not {}",
                envelope.session_id, session_id
            ),
        ));
    }
    if envelope.user_id != caller {
        return Err((
            StatusCode::FORBIDDEN,
            "envelope sender does not match bearer".to_string(),
        ));
    }

    let room = state.rooms.get_or_create(&session_id);
    let delivered = room.publish(envelope);
    debug!(
        "Relayed POST from {} in {} to {} peers",
        caller, session_id, delivered
    );
    Ok(StatusCode::ACCEPTED)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    user_id: ParticipantId,
    role: ParticipantRole,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!(
        "WebSocket upgrade for session {} from {} ({})",
        session_id, params.user_id, params.role
    );
    ws.on_upgrade(move |socket| handle_websocket(socket, session_id, params, state))
}

async fn handle_websocket(
    socket: WebSocket,
    session_id: SessionId,
    params: ConnectParams,
    state: Arc<AppState>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let room = state.rooms.get_or_create(&session_id);
    let connection_id = state.rooms.next_connection_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Tell the newcomer who is already here before anything else is relayed
    for envelope in room.presence(&params.user_id) {
        match SyncProtocol::encode(&envelope) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => warn!("Skipping presence for {}: {}", envelope.user_id, e),
        }
    }
    room.join(
        connection_id,
        RoomPeer::new(params.user_id.clone(), params.role, tx),
    );

    // Forward relayed frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_room = room.clone();
    let user_id = params.user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match SyncProtocol::decode(&text) {
                    Ok(envelope) if envelope.session_id != recv_room.session_id() => {
                        warn!(
                            "Dropping envelope for session {} on {}",
                            envelope.session_id,
                            recv_room.session_id()
                        );
                    }
                    Ok(envelope) if envelope.user_id != user_id => {
                        warn!(
                            "Dropping envelope from {} on connection of {}",
                            envelope.user_id, user_id
                        );
                    }
                    Ok(envelope) => {
                        recv_room.publish(envelope);
                    }
                    Err(e) => warn!("Dropping frame from {}: {}", user_id, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    room.leave(connection_id);
    info!(
        "Connection {} of {} left session {}",
        connection_id, params.user_id, session_id
    );

    // Peers may never see the client's own user_left if it dropped abruptly
    if !room.has_user(&params.user_id) {
        room.publish(Envelope {
            session_id,
            user_id: params.user_id,
            user_role: params.role,
            timestamp: now_millis(),
            payload: Payload::UserLeft,
        });
    }
}
