use super::{KeepaliveHook, KeepaliveTick};
use crate::error::MeshResult;
use crate::protocol::messages::Envelope;
use crate::protocol::topics::TopicBuilder;
use crate::transport::Broker;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Publishes keepalive ticks to `bacon/v1/progress/<node_id>`
pub struct MqttKeepaliveReporter<B: Broker + ?Sized> {
    node_id: String,
    topic: String,
    broker: Arc<B>,
}

impl<B: Broker + ?Sized> MqttKeepaliveReporter<B> {
    pub fn new(node_id: impl Into<String>, broker: Arc<B>) -> Self {
        let node_id = node_id.into();
        Self {
            topic: TopicBuilder::progress(&node_id),
            node_id,
            broker,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl<B: Broker + ?Sized> KeepaliveHook for MqttKeepaliveReporter<B> {
    async fn report(&self, tick: &KeepaliveTick) -> MeshResult<()> {
        let envelope = Envelope::new("progress", serde_json::to_value(tick)?, &self.node_id);
        let payload = Bytes::from(envelope.to_bytes()?);

        trace!(topic = %self.topic, tick = tick.tick, "Publishing keepalive");
        self.broker.publish(&self.topic, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::InMemoryBroker;
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publishes_tick_envelope_on_progress_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let reporter = MqttKeepaliveReporter::new("laptop", broker.clone());

        let tick = KeepaliveTick::new(1, 3, Duration::ZERO, "bacon/v1/data/laptop");
        reporter.report(&tick).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "bacon/v1/progress/laptop");

        let envelope: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(envelope["type"], "progress");
        assert_eq!(envelope["source"], "laptop");
        assert_eq!(envelope["content"]["tick"], 1);
        assert_eq!(envelope["content"]["max_ticks"], 3);
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_as_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_publishes(true);
        let reporter = MqttKeepaliveReporter::new("laptop", broker);

        let tick = KeepaliveTick::new(1, 1, Duration::ZERO, "t");
        assert!(reporter.report(&tick).await.is_err());
    }
}
