//! WebSocket transport: one socket per session carrying JSON text frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{workflow_url, InboundSender, Transport, TransportError, TransportEvent, TransportKind};
use crate::sync::protocol::{Envelope, SessionIdentity};

/// How long disconnect waits for the close frame to drain
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Socket {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Connects to `{ws_base}/workflow/{sessionId}?userId=..&role=..`
pub struct WebSocketTransport {
    base_url: String,
    socket: Mutex<Option<Socket>>,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            socket: Mutex::new(None),
        }
    }

    pub fn endpoint(&self, identity: &SessionIdentity) -> Result<Url, TransportError> {
        let mut url = workflow_url(&self.base_url, &identity.session_id, None)?;
        url.query_pairs_mut()
            .append_pair("userId", &identity.user_id)
            .append_pair("role", identity.role.as_str());
        Ok(url)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(
        &self,
        identity: &SessionIdentity,
        inbound: InboundSender,
    ) -> Result<(), TransportError> {
        self.disconnect().await;

        let url = self.endpoint(identity)?;
        let (stream, _response) = connect_async(url.as_str()).await?;
        info!("WebSocket connected to {}", url);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(value) => {
                                if inbound.send(TransportEvent::Message(value)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Dropping non-JSON frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            debug!("WebSocket reader finished: {:?}", reason);
            let _ = inbound.send(TransportEvent::Closed { reason });
        });

        *self.socket.lock() = Some(Socket {
            outbound,
            reader,
            writer,
        });
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(envelope)?;
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(TransportError::NotConnected)?;
        socket
            .outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed("socket writer stopped".to_string()))
    }

    async fn disconnect(&self) {
        let socket = self.socket.lock().take();
        let Some(mut socket) = socket else {
            return;
        };

        // Stop reporting first so a deliberate close never looks like a drop
        socket.reader.abort();
        let _ = socket.outbound.send(Message::Close(None));
        if tokio::time::timeout(CLOSE_GRACE, &mut socket.writer)
            .await
            .is_err()
        {
            socket.writer.abort();
        }
        debug!("WebSocket transport disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::ParticipantRole;

    #[test]
    fn test_endpoint_carries_identity() {
        let transport = WebSocketTransport::new("ws://localhost:5000");
        let identity = SessionIdentity::new("session-1", "u 1", ParticipantRole::Notary);

        let url = transport.endpoint(&identity).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:5000/workflow/session-1?userId=u+1&role=notary"
        );
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = WebSocketTransport::new("ws://localhost:5000");
        let envelope = SessionIdentity::new("s", "u", ParticipantRole::Client)
            .envelope(1, crate::sync::protocol::Payload::UserJoined);

        assert!(matches!(
            transport.send(&envelope).await,
            Err(TransportError::NotConnected)
        ));
        // No socket: disconnect is a no-op
        transport.disconnect().await;
    }
}
