//! Long-lived subscription loop with automatic restart
//!
//! [`listen`] subscribes to a filter and feeds every message to an
//! [`EventHandler`] until the connection drops. A handler error is logged and
//! the loop moves on to the next message. [`Supervisor`] wraps `listen` and
//! restarts it after a fixed backoff until shutdown is signalled.

use crate::error::MeshResult;
use crate::observability::metrics::metrics;
use crate::protocol::messages::decode_payload;
use crate::shutdown::interruptible_sleep;
use crate::transport::{Broker, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default pause between listener restarts
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Callback for messages delivered by a listener
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `payload` is decoded JSON, or a JSON string holding the raw text
    async fn handle(&self, topic: &str, payload: Value) -> MeshResult<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, topic: &str, payload: Value) -> MeshResult<()> {
        (**self).handle(topic, payload).await
    }
}

/// Run one listening session. Returns when the subscription ends.
pub async fn listen<B, H>(broker: &B, pattern: &str, handler: &H) -> Result<(), TransportError>
where
    B: Broker + ?Sized,
    H: EventHandler + ?Sized,
{
    listen_tracked(broker, pattern, handler, None).await
}

async fn listen_tracked<B, H>(
    broker: &B,
    pattern: &str,
    handler: &H,
    active: Option<&AtomicBool>,
) -> Result<(), TransportError>
where
    B: Broker + ?Sized,
    H: EventHandler + ?Sized,
{
    let mut subscription = broker.subscribe(pattern).await?;
    let _active = ActiveFlag::raise(active);
    info!(pattern, endpoint = %broker.endpoint(), "Listener subscribed");

    loop {
        match subscription.next_message().await {
            Ok(Some(message)) => {
                metrics().record_message_received();
                let payload = decode_payload(&message.payload);
                debug!(topic = %message.topic, "Dispatching message");
                if let Err(e) = handler.handle(&message.topic, payload).await {
                    warn!(topic = %message.topic, error = %e, "Handler failed, continuing");
                }
            }
            Ok(None) => {
                info!(pattern, "Subscription closed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Holds a liveness flag up for as long as a subscription lives, including
/// when the listening future is dropped mid-await
struct ActiveFlag<'a>(Option<&'a AtomicBool>);

impl<'a> ActiveFlag<'a> {
    fn raise(flag: Option<&'a AtomicBool>) -> Self {
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
        }
        Self(flag)
    }
}

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        if let Some(flag) = self.0 {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Keeps a listener alive across connection failures
#[derive(Debug, Clone)]
pub struct Supervisor {
    backoff: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF)
    }
}

impl Supervisor {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Listen on `pattern` until `shutdown_rx` flips to true.
    ///
    /// `active` is true exactly while a subscription is established.
    pub async fn run<B, H>(
        &self,
        broker: Arc<B>,
        pattern: String,
        handler: H,
        mut shutdown_rx: watch::Receiver<bool>,
        active: Arc<AtomicBool>,
    ) where
        B: Broker + ?Sized,
        H: EventHandler,
    {
        info!(pattern = %pattern, backoff_ms = self.backoff.as_millis() as u64, "Supervised listener starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!(pattern = %pattern, "Listener received shutdown");
                    break;
                }
                result = listen_tracked(broker.as_ref(), &pattern, &handler, Some(active.as_ref())) => {
                    match result {
                        Ok(()) => warn!(pattern = %pattern, "Listener ended, restarting"),
                        Err(e) => error!(pattern = %pattern, error = %e, "Listener failed, restarting"),
                    }
                }
            }

            metrics().record_listener_restart();
            if !interruptible_sleep(&mut shutdown_rx, self.backoff).await {
                break;
            }
        }

        info!(pattern = %pattern, "Supervised listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{InMemoryBroker, RecordingHandler};
    use bytes::Bytes;
    use serde_json::json;

    #[tokio::test]
    async fn test_listen_dispatches_until_disconnect() {
        let broker = InMemoryBroker::new();
        let handler = RecordingHandler::new();

        let session = listen(&broker, "bacon/v1/presence/agent/+", &handler);
        let driver = async {
            assert!(broker.wait_for_subscriptions(1, Duration::from_secs(1)).await);
            broker.inject("bacon/v1/presence/agent/a1", r#"{"agent_id":"a1"}"#);
            broker.inject("bacon/v1/presence/agent/a2", "not json");
            assert!(handler.wait_for_count(2, Duration::from_secs(1)).await);
            broker.disconnect_all("gone");
        };

        let (result, ()) = tokio::join!(session, driver);
        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));

        let events = handler.events();
        assert_eq!(events[0].1, json!({"agent_id": "a1"}));
        assert_eq!(events[1].1, json!("not json"));
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_listener() {
        let broker = InMemoryBroker::new();
        let handler = RecordingHandler::failing_on("bad");

        let session = listen(&broker, "t/#", &handler);
        let driver = async {
            assert!(broker.wait_for_subscriptions(1, Duration::from_secs(1)).await);
            broker
                .publish("t/bad", Bytes::from_static(b"{}"))
                .await
                .unwrap();
            broker
                .publish("t/good", Bytes::from_static(b"{}"))
                .await
                .unwrap();
            assert!(handler.wait_for_count(2, Duration::from_secs(1)).await);
            broker.disconnect_all("done");
        };

        let (_, ()) = tokio::join!(session, driver);
        assert_eq!(handler.count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_failure_returns_error() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes(1);
        let handler = RecordingHandler::new();

        let result = listen(&broker, "t/#", &handler).await;
        assert!(matches!(result, Err(TransportError::SubscriptionFailed(_))));
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_stops_on_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(RecordingHandler::new());
        let active = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn({
            let broker = broker.clone();
            let active = active.clone();
            async move {
                Supervisor::default()
                    .run(broker, "t/#".to_string(), handler, shutdown_rx, active)
                    .await
            }
        });

        assert!(broker.wait_for_subscriptions(1, Duration::from_secs(1)).await);
        assert!(active.load(Ordering::SeqCst));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!active.load(Ordering::SeqCst));
        assert_eq!(broker.active_subscriptions(), 0);
    }
}
