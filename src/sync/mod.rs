//! Synchronization module for collaborative workflow sessions.
//!
//! This module keeps two participants' workflow stores eventually consistent.
//! It provides:
//! - A JSON envelope protocol shared by every transport
//! - Pluggable transports (WebSocket, HTTP polling, in-process hub)
//! - The sync engine with its pending queue and fixed-delay retry policy
//! - A typed event surface for the binding layer

pub mod engine;
pub mod events;
pub mod protocol;
pub mod transport;

pub use engine::{SyncEngine, SyncOutcome, SyncStatus};
pub use events::{EventBus, EventKind, ListenerId, Origin, SyncEvent};
pub use protocol::{Envelope, EnvelopeType, ParticipantRole, Payload, SessionIdentity};
pub use transport::{Transport, TransportError, TransportEvent, TransportKind};

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Identifier of one collaborative encounter (stable for a video call)
pub type SessionId = String;

/// Identifier of a participant within a session
pub type ParticipantId = String;

/// Identifier of a form field
pub type FieldId = String;

/// Form values keyed by field id
pub type FormData = BTreeMap<FieldId, serde_json::Value>;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connection attempt superseded by a newer connect or disconnect")]
    Superseded,

    #[error("Session is not in collaborative mode")]
    NotCollaborative,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Configuration for the sync engine and its transport
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Which transport to build
    pub transport: TransportKind,
    /// Base URL of the WebSocket signaling endpoint
    pub ws_base_url: String,
    /// Base URL of the HTTP sync API
    pub api_base_url: String,
    /// Upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts
    pub retry_delay: Duration,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Period of the pending-queue flush
    pub flush_interval: Duration,
    /// Period of the polling transport's GET
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            ws_base_url: "ws://localhost:5000".to_string(),
            api_base_url: "http://localhost:5000".to_string(),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(2000),
            max_retries: 5,
            flush_interval: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(2000),
        }
    }
}

impl SyncConfig {
    /// Create from environment variables, keeping defaults for anything unset
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kind) = env_parse::<TransportKind>("SYNC_TRANSPORT") {
            config.transport = kind;
        }
        if let Ok(url) = std::env::var("SYNC_WS_BASE") {
            config.ws_base_url = url;
        }
        if let Ok(url) = std::env::var("SYNC_API_BASE") {
            config.api_base_url = url;
        }
        if let Some(ms) = env_parse::<u64>("SYNC_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SYNC_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = env_parse::<u32>("SYNC_MAX_RETRIES") {
            config.max_retries = retries;
        }
        if let Some(ms) = env_parse::<u64>("SYNC_FLUSH_INTERVAL_MS").filter(|ms| *ms > 0) {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SYNC_POLL_INTERVAL_MS").filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    pub fn with_ws_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = url.into();
        self
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Read and parse an environment variable, warning on unparseable values
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::ConnectTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Connection attempt timed out after 10s");
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_millis(2000));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.flush_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_sync_config_from_env() {
        std::env::set_var("SYNC_TRANSPORT", "pusher");
        std::env::set_var("SYNC_MAX_RETRIES", "3");
        std::env::set_var("SYNC_RETRY_DELAY_MS", "not-a-number");
        std::env::set_var("SYNC_FLUSH_INTERVAL_MS", "0");

        let config = SyncConfig::from_env();
        assert_eq!(config.transport, TransportKind::Pusher);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(2000));
        assert_eq!(config.flush_interval, Duration::from_millis(1000));

        for key in [
            "SYNC_TRANSPORT",
            "SYNC_MAX_RETRIES",
            "SYNC_RETRY_DELAY_MS",
            "SYNC_FLUSH_INTERVAL_MS",
        ] {
            std::env::remove_var(key);
        }
    }
}
