//! HTTP polling transport.
//!
//! Sends are `POST {api}/workflow/{sessionId}/sync`. Receives come from a
//! periodic `GET` on the same path. The `Authorization: Bearer <userId>`
//! header identifies the caller on both.
//!
//! When the relay returns a sequence cursor it is sent back as `?after=`,
//! and everything in the response is new. Relays without a cursor return
//! their whole history each time; then only envelopes absent from the
//! previous response are forwarded. Sender timestamps are never used to
//! decide what is new, since an offline peer may deliver an old edit late.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{workflow_url, InboundSender, Transport, TransportError, TransportEvent, TransportKind};
use crate::sync::protocol::{Envelope, PollResponse, SessionIdentity};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct PollState {
    identity: Option<SessionIdentity>,
    poller: Option<JoinHandle<()>>,
}

pub struct PollingTransport {
    client: Client,
    api_base: String,
    poll_interval: Duration,
    state: Mutex<PollState>,
}

impl PollingTransport {
    pub fn new(api_base: impl Into<String>, poll_interval: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: Mutex::new(PollState::default()),
        })
    }

    fn stop_poller(&self) {
        if let Some(poller) = self.state.lock().poller.take() {
            poller.abort();
        }
    }
}

/// Where the next poll resumes
#[derive(Debug, Default)]
struct PollCursor {
    /// Relay sequence from the last response that carried one
    after: Option<u64>,
    /// `(userId, timestamp)` of every update in the last cursorless response
    seen: HashSet<(String, i64)>,
}

impl PollCursor {
    /// Forward what this response adds and remember where it ended.
    /// Returns false once the engine side of the channel is gone.
    fn forward(&mut self, response: PollResponse, inbound: &InboundSender) -> bool {
        if let Some(cursor) = response.cursor {
            self.after = Some(cursor);
            self.seen.clear();
            return response
                .updates
                .into_iter()
                .all(|update| inbound.send(TransportEvent::Message(update)).is_ok());
        }

        let mut current = HashSet::with_capacity(response.updates.len());
        let mut open = true;
        for update in response.updates {
            let Some(key) = update_key(&update) else {
                warn!("Dropping polled update without a sender or timestamp");
                continue;
            };
            let fresh = !self.seen.contains(&key);
            current.insert(key);
            if fresh && open {
                open = inbound.send(TransportEvent::Message(update)).is_ok();
            }
        }
        self.seen = current;
        open
    }
}

fn update_key(update: &Value) -> Option<(String, i64)> {
    let user_id = update.get("userId").and_then(Value::as_str)?;
    let timestamp = update.get("timestamp").and_then(Value::as_i64)?;
    Some((user_id.to_string(), timestamp))
}

async fn fetch_updates(
    client: &Client,
    url: &Url,
    user_id: &str,
    after: Option<u64>,
) -> Result<PollResponse, TransportError> {
    let mut request = client.get(url.clone()).bearer_auth(user_id);
    if let Some(after) = after {
        request = request.query(&[("after", after)]);
    }
    Ok(request.send().await?.error_for_status()?.json().await?)
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn connect(
        &self,
        identity: &SessionIdentity,
        inbound: InboundSender,
    ) -> Result<(), TransportError> {
        self.stop_poller();

        let url = workflow_url(&self.api_base, &identity.session_id, Some("sync"))?;

        // The first fetch doubles as the reachability check
        let mut cursor = PollCursor::default();
        let initial = fetch_updates(&self.client, &url, &identity.user_id, None).await?;
        debug!(
            "Polling connected to {} ({} backlog updates)",
            url,
            initial.updates.len()
        );
        if !cursor.forward(initial, &inbound) {
            return Ok(());
        }

        let client = self.client.clone();
        let user_id = identity.user_id.clone();
        let period = self.poll_interval;
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match fetch_updates(&client, &url, &user_id, cursor.after).await {
                    Ok(response) => {
                        if !cursor.forward(response, &inbound) {
                            break;
                        }
                    }
                    Err(e) => warn!("Polling {} failed: {}", url, e),
                }
            }
        });

        let mut state = self.state.lock();
        state.identity = Some(identity.clone());
        state.poller = Some(poller);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let (url, user_id) = {
            let state = self.state.lock();
            let identity = state.identity.as_ref().ok_or(TransportError::NotConnected)?;
            (
                workflow_url(&self.api_base, &identity.session_id, Some("sync"))?,
                identity.user_id.clone(),
            )
        };

        self.client
            .post(url)
            .bearer_auth(user_id)
            .json(envelope)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock();
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        state.identity = None;
    }
}
