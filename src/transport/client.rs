//! Publish/subscribe facade used by every command and component
//!
//! [`TransportClient`] turns (target, kind) pairs into topics, wraps payloads
//! in the [`Envelope`], and is the error boundary for publishing: failures are
//! logged and reported as `false`, never propagated.

use crate::error::sanitize_error_message;
use crate::listener::{self, EventHandler};
use crate::observability::metrics::metrics;
use crate::progress::KeepaliveHook;
use crate::protocol::messages::Envelope;
use crate::protocol::topics::{normalize_hostname, ChannelKind, TopicBuilder};
use crate::transport::{Broker, TransportError};
use crate::wait::{self, CheckOutcome, WaitOutcome, DEFAULT_KEEPALIVE_INTERVAL, MIN_KEEPALIVE_INTERVAL};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, Instrument};

/// Snapshot of a client's identity and connection for `status` output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportStatus {
    pub hostname: String,
    pub endpoint: String,
    pub connection: String,
}

pub struct TransportClient<B: Broker + ?Sized> {
    broker: Arc<B>,
    hostname: String,
    keepalive_interval: Duration,
}

impl<B: Broker + ?Sized> Clone for TransportClient<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            hostname: self.hostname.clone(),
            keepalive_interval: self.keepalive_interval,
        }
    }
}

impl<B: Broker + ?Sized> TransportClient<B> {
    /// `hostname` becomes the envelope source and the default topic target
    pub fn new(broker: Arc<B>, hostname: &str) -> Self {
        Self {
            broker,
            hostname: normalize_hostname(hostname),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    /// Keepalive cadence for waits, at least [`MIN_KEEPALIVE_INTERVAL`]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval.max(MIN_KEEPALIVE_INTERVAL);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Topic for `kind`, addressed to `target` or to this host
    pub fn topic(&self, target: Option<&str>, kind: &ChannelKind) -> String {
        TopicBuilder::topic(target.unwrap_or(&self.hostname), kind)
    }

    /// Publish `content` inside an envelope. Returns whether the broker accepted it.
    pub async fn publish(&self, topic: &str, content: Value, message_type: &str) -> bool {
        let envelope = Envelope::new(message_type, content, &self.hostname);
        match envelope.to_bytes() {
            Ok(bytes) => self.send(topic, Bytes::from(bytes)).await,
            Err(e) => {
                error!(topic, error = %e, "Failed to encode envelope");
                metrics().record_publish(false);
                false
            }
        }
    }

    /// Publish a payload as-is, without an envelope
    pub async fn publish_raw<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> bool {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.send(topic, Bytes::from(bytes)).await,
            Err(e) => {
                error!(topic, error = %e, "Failed to encode payload");
                metrics().record_publish(false);
                false
            }
        }
    }

    async fn send(&self, topic: &str, payload: Bytes) -> bool {
        let span = crate::mqtt_span!(operation = "publish", topic = topic, bytes = payload.len());
        let result = self.broker.publish(topic, payload).instrument(span).await;

        match result {
            Ok(()) => {
                debug!(topic, "Published");
                metrics().record_publish(true);
                true
            }
            Err(e) => {
                error!(
                    topic,
                    endpoint = %self.broker.endpoint(),
                    error = %sanitize_error_message(&e.to_string()),
                    "Publish failed"
                );
                metrics().record_publish(false);
                false
            }
        }
    }

    /// Block until one message arrives on `topic` or `timeout` elapses
    pub async fn wait_for_message(
        &self,
        topic: &str,
        timeout: Duration,
        hook: Arc<dyn KeepaliveHook>,
    ) -> WaitOutcome {
        let span = crate::wait_span!(operation = "wait_for_message", topic = topic);
        wait::wait_for_message(
            self.broker.clone(),
            topic,
            timeout,
            self.keepalive_interval,
            hook,
        )
        .instrument(span)
        .await
    }

    /// Return a message if one shows up within `window`
    pub async fn check_messages(&self, topic: &str, window: Duration) -> CheckOutcome {
        wait::check_messages(self.broker.as_ref(), topic, window).await
    }

    /// Run one listening session on `pattern`
    pub async fn listen<H>(&self, pattern: &str, handler: &H) -> Result<(), TransportError>
    where
        H: EventHandler + ?Sized,
    {
        listener::listen(self.broker.as_ref(), pattern, handler).await
    }

    pub fn status(&self) -> TransportStatus {
        let connection = match self.broker.connection_state() {
            Some(state) => format!("{state:?}"),
            None => "per-call".to_string(),
        };
        TransportStatus {
            hostname: self.hostname.clone(),
            endpoint: self.broker.endpoint(),
            connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::PresenceAnnouncement;
    use crate::testing::mocks::InMemoryBroker;
    use serde_json::json;

    fn client() -> (Arc<InMemoryBroker>, TransportClient<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let client = TransportClient::new(broker.clone(), "Studio.Local");
        (broker, client)
    }

    #[test]
    fn test_default_target_is_normalized_hostname() {
        let (_, client) = client();

        assert_eq!(client.hostname(), "studio-local");
        assert_eq!(
            client.topic(None, &ChannelKind::Data),
            "bacon/v1/data/studio-local"
        );
        assert_eq!(
            client.topic(Some("a1"), &ChannelKind::Presence),
            "bacon/v1/presence/agent/a1"
        );
    }

    #[test]
    fn test_zero_keepalive_interval_is_raised() {
        let (_, client) = client();

        let client = client.with_keepalive_interval(Duration::ZERO);

        assert_eq!(client.keepalive_interval, MIN_KEEPALIVE_INTERVAL);
    }

    #[tokio::test]
    async fn test_publish_wraps_envelope() {
        let (broker, client) = client();

        assert!(client.publish("bacon/v1/data/laptop", json!({"text": "hi"}), "data").await);

        let published = broker.published_on("bacon/v1/data/laptop");
        assert_eq!(published.len(), 1);
        let envelope: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(envelope["type"], "data");
        assert_eq!(envelope["source"], "studio-local");
        assert_eq!(envelope["content"], json!({"text": "hi"}));
        assert!(envelope["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_publish_failure_returns_false() {
        let (broker, client) = client();
        broker.fail_publishes(true);

        assert!(!client.publish("t", json!(1), "data").await);
        assert!(!client.publish_raw("t", &json!({"a": 1})).await);
    }

    #[tokio::test]
    async fn test_publish_raw_sends_bare_payload() {
        let (broker, client) = client();
        let announcement = PresenceAnnouncement::new("a1", "n1", "online");

        assert!(client.publish_raw("bacon/v1/presence/agent/a1", &announcement).await);

        let payload: Value = serde_json::from_slice(&broker.published()[0].payload).unwrap();
        assert_eq!(payload["agent_id"], "a1");
        assert!(payload.get("content").is_none());
    }

    #[test]
    fn test_status_for_per_call_broker() {
        let (_, client) = client();
        let status = client.status();

        assert_eq!(status.endpoint, "memory://local");
        assert_eq!(status.connection, "per-call");
    }
}
