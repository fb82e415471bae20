//! In-process stand-ins for the broker and the callback seams
//!
//! [`InMemoryBroker`] routes by MQTT topic filter the way a real broker does,
//! and lets tests inject publish failures, subscribe failures and mid-stream
//! disconnects without a network.

use crate::error::{MeshError, MeshResult};
use crate::listener::EventHandler;
use crate::progress::{KeepaliveHook, KeepaliveTick};
use crate::protocol::topics::topic_matches;
use crate::transport::{Broker, InboundMessage, Subscription, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type Delivery = Result<InboundMessage, TransportError>;

struct Subscriber {
    id: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    /// Publishes nobody was subscribed to yet, handed to the first matching subscriber
    pending: Vec<InboundMessage>,
    published: Vec<InboundMessage>,
    fail_publishes: bool,
    failing_subscribes: u32,
    subscribe_attempts: u32,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait_until<F>(notify: &Notify, timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let notified = notify.notified();
            if condition() {
                return;
            }
            notified.await;
        }
    })
    .await
    .is_ok()
}

/// Broker that lives entirely in memory
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload accepted by `publish`, in order
    pub fn published(&self) -> Vec<InboundMessage> {
        lock(&self.state).published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<InboundMessage> {
        lock(&self.state)
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn fail_publishes(&self, fail: bool) {
        lock(&self.state).fail_publishes = fail;
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: u32) {
        lock(&self.state).failing_subscribes = n;
    }

    pub fn subscribe_attempts(&self) -> u32 {
        lock(&self.state).subscribe_attempts
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Kill every live subscription with a connection error
    pub fn disconnect_all(&self, reason: &str) {
        let subscribers = std::mem::take(&mut lock(&self.state).subscribers);
        for subscriber in subscribers {
            let _ = subscriber
                .tx
                .send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
        self.notify.notify_waiters();
    }

    /// Wait until at least `n` subscriptions are live
    pub async fn wait_for_subscriptions(&self, n: usize, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.active_subscriptions() >= n).await
    }

    /// Wait until `subscribe` has been called at least `n` times
    pub async fn wait_for_subscribe_attempts(&self, n: u32, timeout: Duration) -> bool {
        wait_until(&self.notify, timeout, || self.subscribe_attempts() >= n).await
    }

    /// Inject a message as if some other client had published it
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.deliver(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            retain: false,
        });
    }

    fn deliver(&self, message: InboundMessage) {
        let mut state = lock(&self.state);
        state.published.push(message.clone());

        let mut matched = false;
        for subscriber in state
            .subscribers
            .iter()
            .filter(|s| topic_matches(&s.filter, &message.topic))
        {
            matched |= subscriber.tx.send(Ok(message.clone())).is_ok();
        }
        if !matched {
            state.pending.push(message);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if lock(&self.state).fail_publishes {
            return Err(TransportError::PublishFailed(
                "injected publish failure".to_string(),
            ));
        }
        self.deliver(InboundMessage {
            topic: topic.to_string(),
            payload,
            retain: false,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let mut state = lock(&self.state);
        state.subscribe_attempts += 1;
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            drop(state);
            self.notify.notify_waiters();
            return Err(TransportError::SubscriptionFailed(
                "injected subscribe failure".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pending = std::mem::take(&mut state.pending);
        let (queued, remaining): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|m| topic_matches(filter, &m.topic));
        state.pending = remaining;
        for message in queued {
            let _ = tx.send(Ok(message));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.push(Subscriber {
            id,
            filter: filter.to_string(),
            tx,
        });
        drop(state);
        self.notify.notify_waiters();

        Ok(Box::new(InMemorySubscription {
            id,
            filter: filter.to_string(),
            rx,
            state: self.state.clone(),
            notify: self.notify.clone(),
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

pub struct InMemorySubscription {
    id: u64,
    filter: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn filter(&self) -> &str {
        &self.filter
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        lock(&self.state).subscribers.retain(|s| s.id != self.id);
        self.notify.notify_waiters();
    }
}

/// Keepalive hook that records every tick
#[derive(Default)]
pub struct RecordingKeepalive {
    ticks: Mutex<Vec<KeepaliveTick>>,
    fail: bool,
}

impl RecordingKeepalive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records ticks but reports an error for each
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn ticks(&self) -> Vec<KeepaliveTick> {
        self.ticks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.ticks().len()
    }
}

#[async_trait]
impl KeepaliveHook for RecordingKeepalive {
    async fn report(&self, tick: &KeepaliveTick) -> MeshResult<()> {
        self.ticks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tick.clone());
        if self.fail {
            return Err(MeshError::internal("keepalive sink unavailable"));
        }
        Ok(())
    }
}

/// Event handler that records what it was given
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(String, Value)>>,
    fail_on: Option<String>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records everything but fails for topics containing `fragment`
    pub fn failing_on(fragment: impl Into<String>) -> Self {
        Self {
            fail_on: Some(fragment.into()),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.events().len()
    }

    pub fn wait_for_count(&self, n: usize, timeout: Duration) -> impl Future<Output = bool> + '_ {
        wait_until(&self.notify, timeout, move || self.count() >= n)
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, topic: &str, payload: Value) -> MeshResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((topic.to_string(), payload));
        self.notify.notify_waiters();

        match &self.fail_on {
            Some(fragment) if topic.contains(fragment.as_str()) => {
                Err(MeshError::handler(format!("refusing {topic}")))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_by_filter() {
        let broker = InMemoryBroker::new();
        let mut presence = broker.subscribe("bacon/v1/presence/agent/+").await.unwrap();
        let mut everything = broker.subscribe("bacon/#").await.unwrap();

        broker
            .publish("bacon/v1/presence/agent/a1", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(
            presence.next_message().await.unwrap().unwrap().topic,
            "bacon/v1/presence/agent/a1"
        );
        assert_eq!(
            everything.next_message().await.unwrap().unwrap().topic,
            "bacon/v1/presence/agent/a1"
        );
    }

    #[tokio::test]
    async fn test_unmatched_publishes_wait_for_first_subscriber() {
        let broker = InMemoryBroker::new();
        broker.inject("topic/x", "first");
        broker.inject("topic/y", "other");

        let mut sub = broker.subscribe("topic/x").await.unwrap();
        let message = sub.next_message().await.unwrap().unwrap();
        assert_eq!(&message.payload[..], b"first");

        // Consumed: a second subscriber does not see it
        let mut late = broker.subscribe("topic/+").await.unwrap();
        let message = late.next_message().await.unwrap().unwrap();
        assert_eq!(message.topic, "topic/y");
    }

    #[tokio::test]
    async fn test_drop_unregisters_subscription() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("a").await.unwrap();
        assert_eq!(broker.active_subscriptions(), 1);
        drop(sub);
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes(1);
        assert!(broker.subscribe("a").await.is_err());
        assert!(broker.subscribe("a").await.is_ok());
        assert_eq!(broker.subscribe_attempts(), 2);

        broker.fail_publishes(true);
        assert!(broker.publish("a", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_all_errors_live_subscriptions() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("a").await.unwrap();

        broker.disconnect_all("broker restarted");

        assert!(matches!(
            sub.next_message().await,
            Err(TransportError::ConnectionLost(reason)) if reason == "broker restarted"
        ));
        assert!(matches!(sub.next_message().await, Ok(None)));
        assert_eq!(broker.active_subscriptions(), 0);
    }
}
