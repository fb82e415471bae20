//! Block until one message arrives on a topic, proving liveness meanwhile
//!
//! [`wait_for_message`] runs two tasks: a listener that resolves on the first
//! message of a fresh subscription, and a ticker that reports a
//! [`KeepaliveTick`] immediately and then once per interval. The caller races
//! the listener against the timeout. Both tasks are aborted and awaited before
//! the call returns, whichever way it returns, and a dropped wait aborts them
//! through [`ScopedTasks`].

use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::progress::{max_ticks, KeepaliveHook, KeepaliveTick};
use crate::protocol::messages::decode_payload;
use crate::shutdown::stop_task;
use crate::transport::{Broker, InboundMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default keepalive cadence
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Shorter intervals, zero included, are raised to this
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Received,
    Timeout,
    /// The subscription failed; `message` holds the sanitized reason
    Error,
}

/// Result of a wait. Never an `Err`: callers branch on `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub status: WaitStatus,
    pub message: Option<Value>,
    /// Concrete topic the message arrived on, or the requested topic
    pub topic: String,
    #[serde(rename = "elapsed_seconds", serialize_with = "serialize_seconds")]
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

impl WaitOutcome {
    fn received(message: InboundMessage, elapsed: Duration) -> Self {
        Self {
            status: WaitStatus::Received,
            message: Some(decode_payload(&message.payload)),
            topic: message.topic,
            elapsed,
            timestamp: Utc::now(),
        }
    }

    fn timeout(topic: &str, elapsed: Duration) -> Self {
        Self {
            status: WaitStatus::Timeout,
            message: None,
            topic: topic.to_string(),
            elapsed,
            timestamp: Utc::now(),
        }
    }

    fn error(topic: &str, reason: String, elapsed: Duration) -> Self {
        Self {
            status: WaitStatus::Error,
            message: Some(Value::String(reason)),
            topic: topic.to_string(),
            elapsed,
            timestamp: Utc::now(),
        }
    }

    pub fn is_received(&self) -> bool {
        self.status == WaitStatus::Received
    }
}

fn serialize_seconds<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_millis() as f64 / 1000.0)
}

/// Result of a short non-blocking poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub has_message: bool,
    pub message: Option<Value>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Background tasks owned by one wait. Aborted on drop.
#[derive(Default)]
struct ScopedTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ScopedTasks {
    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push((name, tokio::spawn(task)));
    }

    async fn shutdown(mut self) {
        for (name, handle) in self.handles.drain(..) {
            stop_task(handle, name).await;
        }
    }
}

impl Drop for ScopedTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }
}

enum Delivery {
    Message(InboundMessage),
    Failed(String),
}

/// Wait for the first message on `topic`, or until `timeout` elapses.
pub async fn wait_for_message<B>(
    broker: Arc<B>,
    topic: &str,
    timeout: Duration,
    interval: Duration,
    hook: Arc<dyn KeepaliveHook>,
) -> WaitOutcome
where
    B: Broker + ?Sized,
{
    let interval = interval.max(MIN_KEEPALIVE_INTERVAL);
    let started = Instant::now();
    let (result_tx, result_rx) = oneshot::channel();
    let (done_tx, done_rx) = watch::channel(false);

    info!(topic, timeout_secs = timeout.as_secs(), "Waiting for message");

    let mut tasks = ScopedTasks::default();
    tasks.spawn(
        "wait-listener",
        receive_first(broker, topic.to_string(), result_tx, done_tx),
    );
    tasks.spawn(
        "wait-ticker",
        tick_until_done(
            hook,
            topic.to_string(),
            interval,
            max_ticks(timeout, interval),
            started,
            done_rx,
        ),
    );

    let delivery = tokio::time::timeout(timeout, result_rx).await;
    tasks.shutdown().await;
    let elapsed = started.elapsed();

    let outcome = match delivery {
        Ok(Ok(Delivery::Message(message))) => WaitOutcome::received(message, elapsed),
        Ok(Ok(Delivery::Failed(reason))) => WaitOutcome::error(topic, reason, elapsed),
        Ok(Err(_)) => WaitOutcome::error(
            topic,
            "Listener stopped without a result".to_string(),
            elapsed,
        ),
        Err(_) => WaitOutcome::timeout(topic, elapsed),
    };

    match outcome.status {
        WaitStatus::Received => info!(topic = %outcome.topic, elapsed_ms = elapsed.as_millis() as u64, "Wait satisfied"),
        WaitStatus::Timeout => info!(topic, elapsed_ms = elapsed.as_millis() as u64, "Wait timed out"),
        WaitStatus::Error => warn!(topic, reason = ?outcome.message, "Wait failed"),
    }
    metrics().record_wait(outcome.status);
    outcome
}

async fn receive_first<B>(
    broker: Arc<B>,
    topic: String,
    result_tx: oneshot::Sender<Delivery>,
    done_tx: watch::Sender<bool>,
) where
    B: Broker + ?Sized,
{
    let delivery = match broker.subscribe(&topic).await {
        Ok(mut subscription) => match subscription.next_message().await {
            Ok(Some(message)) => Delivery::Message(message),
            Ok(None) => Delivery::Failed(format!(
                "Subscription to {topic} closed before a message arrived"
            )),
            Err(e) => Delivery::Failed(sanitize_error_message(&e.to_string())),
        },
        Err(e) => Delivery::Failed(sanitize_error_message(&e.to_string())),
    };

    let _ = done_tx.send(true);
    let _ = result_tx.send(delivery);
}

async fn tick_until_done(
    hook: Arc<dyn KeepaliveHook>,
    topic: String,
    interval: Duration,
    max_ticks: u32,
    started: Instant,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u32;

    loop {
        tokio::select! {
            changed = done_rx.changed() => {
                if changed.is_err() || *done_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if *done_rx.borrow() {
                    break;
                }
                tick += 1;
                let report = KeepaliveTick::new(tick, max_ticks, started.elapsed(), &topic);
                metrics().record_keepalive_tick();
                debug!(tick, max_ticks, "Keepalive tick");
                if let Err(e) = hook.report(&report).await {
                    warn!(tick, error = %e, "Keepalive hook failed");
                }
            }
        }
    }
}

/// Poll `topic` for at most `window` and return whatever arrived first
pub async fn check_messages<B>(broker: &B, topic: &str, window: Duration) -> CheckOutcome
where
    B: Broker + ?Sized,
{
    let attempt = tokio::time::timeout(window, async {
        let mut subscription = broker.subscribe(topic).await?;
        subscription.next_message().await
    })
    .await;

    match attempt {
        Ok(Ok(Some(message))) => CheckOutcome {
            has_message: true,
            message: Some(decode_payload(&message.payload)),
            topic: message.topic,
            error: None,
        },
        Ok(Ok(None)) | Err(_) => CheckOutcome {
            has_message: false,
            message: None,
            topic: topic.to_string(),
            error: None,
        },
        Ok(Err(e)) => CheckOutcome {
            has_message: false,
            message: None,
            topic: topic.to_string(),
            error: Some(sanitize_error_message(&e.to_string())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoOpKeepalive;
    use crate::testing::mocks::{InMemoryBroker, RecordingKeepalive};
    use bytes::Bytes;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_message_already_queued_is_received() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject("bacon/v1/data/laptop", r#"{"text":"wake"}"#);

        let outcome = wait_for_message(
            broker.clone(),
            "bacon/v1/data/laptop",
            Duration::from_secs(60),
            DEFAULT_KEEPALIVE_INTERVAL,
            Arc::new(NoOpKeepalive),
        )
        .await;

        assert!(outcome.is_received());
        assert_eq!(outcome.message, Some(json!({"text": "wake"})));
        assert_eq!(outcome.topic, "bacon/v1/data/laptop");
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_wait_reports_concrete_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject("bacon/v1/signal/agent/worker-2", "plain text");

        let outcome = wait_for_message(
            broker,
            "bacon/v1/signal/agent/+",
            Duration::from_secs(5),
            DEFAULT_KEEPALIVE_INTERVAL,
            Arc::new(NoOpKeepalive),
        )
        .await;

        assert_eq!(outcome.topic, "bacon/v1/signal/agent/worker-2");
        assert_eq!(outcome.message, Some(json!("plain text")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_no_publisher() {
        let broker = Arc::new(InMemoryBroker::new());

        let outcome = wait_for_message(
            broker,
            "topic/x",
            Duration::from_secs(3),
            DEFAULT_KEEPALIVE_INTERVAL,
            Arc::new(NoOpKeepalive),
        )
        .await;

        assert_eq!(outcome.status, WaitStatus::Timeout);
        assert_eq!(outcome.message, None);
        assert!(outcome.elapsed >= Duration::from_secs(3));
        assert!(outcome.elapsed < Duration::from_secs(3) + DEFAULT_KEEPALIVE_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_ticks() {
        let broker = Arc::new(InMemoryBroker::new());
        let hook = Arc::new(RecordingKeepalive::new());

        let outcome = wait_for_message(
            broker,
            "topic/x",
            Duration::from_millis(10),
            Duration::ZERO,
            hook.clone(),
        )
        .await;

        assert_eq!(outcome.status, WaitStatus::Timeout);
        let ticks = hook.ticks();
        assert!(ticks.len() >= 2, "ticker stopped after {} ticks", ticks.len());
        assert!(ticks.iter().all(|t| t.max_ticks == 11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_yields_error_status() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_subscribes(1);
        let hook = Arc::new(RecordingKeepalive::new());

        let outcome = wait_for_message(
            broker,
            "topic/x",
            Duration::from_secs(60),
            DEFAULT_KEEPALIVE_INTERVAL,
            hook,
        )
        .await;

        assert_eq!(outcome.status, WaitStatus::Error);
        let reason = outcome.message.unwrap();
        assert!(reason.as_str().unwrap().contains("injected subscribe failure"));
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_failure_does_not_end_wait() {
        let broker = Arc::new(InMemoryBroker::new());
        let hook = Arc::new(RecordingKeepalive::failing());

        let outcome = wait_for_message(
            broker,
            "topic/x",
            Duration::from_secs(65),
            DEFAULT_KEEPALIVE_INTERVAL,
            hook.clone(),
        )
        .await;

        assert_eq!(outcome.status, WaitStatus::Timeout);
        assert!(hook.count() >= 3, "Expected ticks to continue, got {}", hook.count());
    }

    #[test]
    fn test_outcome_serializes_elapsed_seconds() {
        let outcome = WaitOutcome::timeout("topic/x", Duration::from_millis(3_250));
        let value = serde_json::to_value(&outcome).unwrap();

        assert_eq!(value["status"], "timeout");
        assert_eq!(value["message"], Value::Null);
        assert_eq!(value["topic"], "topic/x");
        assert_eq!(value["elapsed_seconds"], 3.25);
        assert!(value.get("elapsed").is_none());
    }

    #[tokio::test]
    async fn test_check_messages_empty_topic() {
        let broker = InMemoryBroker::new();
        let outcome = check_messages(&broker, "topic/x", Duration::from_millis(50)).await;

        assert!(!outcome.has_message);
        assert_eq!(outcome.topic, "topic/x");
        assert_eq!(outcome.error, None);
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_check_messages_returns_queued_message() {
        let broker = InMemoryBroker::new();
        broker
            .publish("topic/x", Bytes::from_static(b"{\"n\":1}"))
            .await
            .unwrap();

        let outcome = check_messages(&broker, "topic/x", Duration::from_millis(500)).await;
        assert!(outcome.has_message);
        assert_eq!(outcome.message, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_check_messages_reports_subscribe_error() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes(1);

        let outcome = check_messages(&broker, "topic/x", Duration::from_millis(500)).await;
        assert!(!outcome.has_message);
        assert!(outcome.error.is_some());
    }
}
