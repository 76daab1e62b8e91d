//! Transport adapters.
//!
//! A transport moves envelopes between this participant and a session
//! endpoint. It forwards every inbound JSON object to the engine unfiltered
//! and reports socket loss as [`TransportEvent::Closed`]; classification,
//! queueing and retry all live in the engine.

mod memory;
mod polling;
mod websocket;

pub use memory::{MemoryHub, MemoryTransport};
pub use polling::PollingTransport;
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use super::protocol::{Envelope, SessionIdentity};
use super::SyncConfig;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

/// Inbound traffic from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed JSON object from the endpoint
    Message(serde_json::Value),
    /// The connection was lost; the engine decides whether to retry
    Closed { reason: Option<String> },
}

pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// Available transport backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Polling,
    /// Hosted document store; runs over polling
    Firestore,
    /// Hosted pub/sub; runs over polling
    Pusher,
    /// In-process hub
    Memory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Polling => "polling",
            TransportKind::Firestore => "firestore",
            TransportKind::Pusher => "pusher",
            TransportKind::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "polling" | "http" => Ok(TransportKind::Polling),
            "firestore" => Ok(TransportKind::Firestore),
            "pusher" => Ok(TransportKind::Pusher),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// A bidirectional envelope channel to a session endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Open the channel for `identity`. Inbound traffic is pushed to
    /// `inbound` until the channel closes or [`Transport::disconnect`] runs.
    async fn connect(
        &self,
        identity: &SessionIdentity,
        inbound: InboundSender,
    ) -> Result<(), TransportError>;

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Tear the channel down. Safe to call when not connected.
    async fn disconnect(&self);
}

/// Build the transport selected by `config`
pub fn build_transport(config: &SyncConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config.transport {
        TransportKind::WebSocket => Ok(Arc::new(WebSocketTransport::new(&config.ws_base_url))),
        TransportKind::Polling => Ok(Arc::new(PollingTransport::new(
            &config.api_base_url,
            config.poll_interval,
        )?)),
        kind @ (TransportKind::Firestore | TransportKind::Pusher) => {
            info!(
                "{} transport has no native adapter, falling back to polling",
                kind
            );
            Ok(Arc::new(PollingTransport::new(
                &config.api_base_url,
                config.poll_interval,
            )?))
        }
        TransportKind::Memory => Err(TransportError::Unsupported(
            "memory transports are created from a MemoryHub".to_string(),
        )),
    }
}

/// `{base}/workflow/{session_id}[/{suffix}]`, keeping any path on `base`
pub(crate) fn workflow_url(
    base: &str,
    session_id: &str,
    suffix: Option<&str>,
) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(base).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base, e)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
        segments.pop_if_empty().push("workflow").push(session_id);
        if let Some(suffix) = suffix {
            segments.push(suffix);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_url() {
        let url = workflow_url("ws://localhost:5000", "abc", None).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:5000/workflow/abc");

        let url = workflow_url("https://api.example.com/v1/", "abc", Some("sync")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/workflow/abc/sync");
    }

    #[test]
    fn test_workflow_url_escapes_session() {
        let url = workflow_url("http://localhost:5000", "a b/c", None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/workflow/a%20b%2Fc");
    }

    #[test]
    fn test_workflow_url_rejects_garbage() {
        assert!(matches!(
            workflow_url("not a url", "abc", None),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("WebSocket".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert_eq!("firestore".parse::<TransportKind>().unwrap(), TransportKind::Firestore);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_build_transport_fallback() {
        let config = SyncConfig::default().with_transport(TransportKind::Pusher);
        let transport = build_transport(&config).unwrap();
        assert_eq!(transport.kind(), TransportKind::Polling);

        let config = SyncConfig::default().with_transport(TransportKind::Memory);
        assert!(build_transport(&config).is_err());
    }
}
