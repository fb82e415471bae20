//! Presence announcements for this node's own agent

use crate::config::NodeSection;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{PresenceAnnouncement, PresenceMeta};
use crate::protocol::topics::TopicBuilder;
use crate::transport::{Broker, TransportClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const ONLINE: &str = "online";

pub struct PresenceAnnouncer<B: Broker + ?Sized> {
    client: TransportClient<B>,
    announcement: PresenceAnnouncement,
}

impl<B: Broker + ?Sized> PresenceAnnouncer<B> {
    pub fn new(client: TransportClient<B>, announcement: PresenceAnnouncement) -> Self {
        Self {
            client,
            announcement,
        }
    }

    /// Announce `agent_id` as running on this node
    pub fn for_node(client: TransportClient<B>, node: &NodeSection, agent_id: &str, state: &str) -> Self {
        let meta = PresenceMeta {
            operator: node.operator.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            role: Some(node.role.clone()),
            hostname: Some(client.hostname().to_string()),
            os: Some(std::env::consts::OS.to_string()),
        };
        let announcement = PresenceAnnouncement::new(agent_id, &node.id, state)
            .with_meta(meta)
            .with_capabilities(node.capabilities.clone());
        Self::new(client, announcement)
    }

    pub fn announcement(&self) -> &PresenceAnnouncement {
        &self.announcement
    }

    pub fn topic(&self) -> String {
        TopicBuilder::presence(&self.announcement.agent_id)
    }

    /// Publish one bare presence payload stamped with the current time
    pub async fn announce_once(&self) -> bool {
        let payload = self.announcement.refreshed();
        let published = self.client.publish_raw(&self.topic(), &payload).await;
        if published {
            info!(
                agent_id = %payload.agent_id,
                state = %payload.state,
                "Published presence"
            );
        }
        published
    }
}

impl<B: Broker + ?Sized> PresenceAnnouncer<B> {
    /// Republish every `interval` until shutdown. The first tick is skipped;
    /// callers announce once themselves before starting the heartbeat.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Heartbeat stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        metrics().record_heartbeat();
                        if !self.announce_once().await {
                            // Keep going; the next tick retries
                            error!(topic = %self.topic(), "Heartbeat publish failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::protocol::messages::PresenceEvent;
    use crate::testing::mocks::InMemoryBroker;
    use serde_json::Value;

    fn announcer(broker: Arc<InMemoryBroker>) -> PresenceAnnouncer<InMemoryBroker> {
        let mut config = MeshConfig::test_config();
        config.node.id = "studio".to_string();
        config.node.operator = Some("harper".to_string());
        config.node.capabilities = vec!["gpu".to_string()];
        let client = TransportClient::new(broker, "studio");
        PresenceAnnouncer::for_node(client, &config.node, "studio-agent", ONLINE)
    }

    #[tokio::test]
    async fn test_announce_publishes_bare_presence() {
        let broker = Arc::new(InMemoryBroker::new());
        let announcer = announcer(broker.clone());

        assert!(announcer.announce_once().await);

        let published = broker.published_on("bacon/v1/presence/agent/studio-agent");
        assert_eq!(published.len(), 1);
        let payload: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(payload["v"], "1.2");
        assert_eq!(payload["node_id"], "studio");
        assert_eq!(payload["meta"]["operator"], "harper");

        // What we publish, the reconciler can read back
        let event = PresenceEvent::from_payload(&payload).unwrap();
        assert_eq!(event.agent_id, "studio-agent");
        assert_eq!(event.capabilities, vec!["gpu".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_republishes_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let announcer = Arc::new(announcer(broker.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = announcer.spawn_heartbeat(Duration::from_secs(60), shutdown_rx);
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(broker.published().len(), 2);
    }
}
