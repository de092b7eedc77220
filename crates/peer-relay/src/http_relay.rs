//! [`RelayTransport`] over HTTP: `POST` to send, server-sent events to subscribe.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::RwLock;
use reqwest::Client;
use reqwest::header::ACCEPT;
use reqwest_eventsource::{Event, EventSource};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::identity::AccessSession;
use crate::relay::{InboundStream, RelayTransport, SendFailure};
use crate::signal::{InboundSignal, RelayEnvelope};

/// SSE event name carrying inbound signals.
pub const SIGNAL_EVENT: &str = "signal";
/// Status reported when a send never got a response.
pub const NO_RESPONSE: u16 = 0;
const UNAUTHORIZED: u16 = 401;

pub struct HttpRelay {
    client: Client,
    provider: Url,
    session: RwLock<Option<AccessSession>>,
}

impl HttpRelay {
    pub fn new(provider: Url) -> Self {
        Self::with_client(Client::new(), provider)
    }

    pub fn with_client(client: Client, provider: Url) -> Self {
        Self {
            client,
            provider,
            session: RwLock::new(None),
        }
    }

    /// `{provider}/relay/{user_id}`
    pub fn relay_url(&self, user_id: &str) -> RelayResult<Url> {
        let mut url = self.provider.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RelayError::Config(format!("provider {} cannot be a base", self.provider)))?;
            segments.pop_if_empty();
            segments.push("relay");
            segments.push(user_id);
        }
        Ok(url)
    }

    fn session(&self) -> Option<AccessSession> {
        self.session.read().clone()
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    fn authorize(&self, session: Option<&AccessSession>) {
        *self.session.write() = session.cloned();
    }

    async fn send(&self, envelope: RelayEnvelope) -> Result<(), SendFailure> {
        let Some(session) = self.session() else {
            return Err(SendFailure::new(UNAUTHORIZED, "no access session"));
        };
        let url = self
            .relay_url(&session.user_id)
            .map_err(|err| SendFailure::new(NO_RESPONSE, err.to_string()))?;
        let kind = envelope.message.kind();
        let response = self
            .client
            .post(url)
            .bearer_auth(&session.access_token)
            .json(&envelope)
            .send()
            .await
            .map_err(|err| {
                let status = err.status().map_or(NO_RESPONSE, |status| status.as_u16());
                SendFailure::new(status, err.to_string())
            })?;
        let status = response.status();
        if status.is_success() {
            trace!(target = "relay", kind, dst = %envelope.destination, "signal posted");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let reason = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_string()
        } else {
            body
        };
        Err(SendFailure::new(status.as_u16(), reason))
    }

    async fn subscribe(&self, user_id: &str) -> RelayResult<InboundStream> {
        let session = self.session().ok_or(RelayError::AccessDenied)?;
        let url = self.relay_url(user_id)?;
        let request = self
            .client
            .get(url.clone())
            .bearer_auth(&session.access_token)
            .header(ACCEPT, "text/event-stream");
        let source = EventSource::new(request)
            .map_err(|err| RelayError::Subscription(err.to_string()))?;
        debug!(target = "relay", url = %url, "subscribing to relay stream");

        let stream = stream::unfold(Some(source), |state| async move {
            let mut source = state?;
            loop {
                match source.next().await {
                    Some(Ok(Event::Open)) => {
                        trace!(target = "relay", "relay stream open");
                    }
                    Some(Ok(Event::Message(message))) => {
                        if message.event != SIGNAL_EVENT {
                            trace!(target = "relay", event = %message.event, "ignoring relay event");
                            continue;
                        }
                        let item = serde_json::from_str::<InboundSignal>(&message.data)
                            .map_err(|err| RelayError::MalformedSignal(err.to_string()));
                        return Some((item, Some(source)));
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(err)) => {
                        warn!(target = "relay", error = %err, "relay stream failed");
                        source.close();
                        return Some((Err(RelayError::Subscription(err.to_string())), None));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;
    use crate::signal::SignalMessage;

    #[test]
    fn relay_url_appends_user() {
        let relay = HttpRelay::new(Url::parse("https://relay.example.com/").unwrap());
        assert_eq!(
            relay.relay_url("alice").unwrap().as_str(),
            "https://relay.example.com/relay/alice"
        );

        let relay = HttpRelay::new(Url::parse("https://relay.example.com:8443/api").unwrap());
        assert_eq!(
            relay.relay_url("bob smith").unwrap().as_str(),
            "https://relay.example.com:8443/api/relay/bob%20smith"
        );
    }

    #[tokio::test]
    async fn send_without_session_is_unauthorized() {
        let relay = HttpRelay::new(Url::parse("http://127.0.0.1:9").unwrap());
        let envelope = RelayEnvelope {
            source: PeerIdentity::new("alice", "chat"),
            destination: PeerIdentity::new("bob", "chat"),
            message: SignalMessage::Disconnect,
        };
        let failure = relay.send(envelope).await.unwrap_err();
        assert_eq!(failure.status, UNAUTHORIZED);
        assert!(!failure.is_transient());
    }

    #[tokio::test]
    async fn subscribe_requires_session() {
        let relay = HttpRelay::new(Url::parse("http://127.0.0.1:9").unwrap());
        assert!(matches!(
            relay.subscribe("alice").await,
            Err(RelayError::AccessDenied)
        ));
    }

    #[test]
    fn authorize_replaces_session() {
        let relay = HttpRelay::new(Url::parse("http://127.0.0.1:9").unwrap());
        let session = AccessSession::from_token("alice:secret", "chat").unwrap();
        relay.authorize(Some(&session));
        assert_eq!(relay.session(), Some(session));
        relay.authorize(None);
        assert!(relay.session().is_none());
    }
}
