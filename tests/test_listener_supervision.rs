//! Supervised listener restart and shutdown behavior


use bacon_mesh::listener::Supervisor;
use bacon_mesh::testing::{InMemoryBroker, RecordingHandler};
use bacon_mesh::{ControlPlane, TopicBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{memory_store, presence_payload, test_config};
use tokio::sync::watch;

struct Harness {
    broker: Arc<InMemoryBroker>,
    handler: Arc<RecordingHandler>,
    active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_supervised(backoff: Duration, pattern: &str) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(RecordingHandler::new());
    let active = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn({
        let broker = broker.clone();
        let handler = handler.clone();
        let active = active.clone();
        let pattern = pattern.to_string();
        async move {
            Supervisor::new(backoff)
                .run(broker, pattern, handler, shutdown_rx, active)
                .await
        }
    });

    Harness {
        broker,
        handler,
        active,
        shutdown_tx,
        task,
    }
}

#[tokio::test(start_paused = true)]
async fn test_listener_restarts_after_disconnect() {
    // Arrange
    let harness = spawn_supervised(Duration::from_secs(5), "bacon/v1/signal/agent/+");
    assert!(harness
        .broker
        .wait_for_subscriptions(1, Duration::from_secs(1))
        .await);
    assert_eq!(harness.broker.subscribe_attempts(), 1);

    // Act
    harness.broker.disconnect_all("broker restarted");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let active_during_backoff = harness.active.load(Ordering::SeqCst);
    let resubscribed = harness
        .broker
        .wait_for_subscribe_attempts(2, Duration::from_secs(10))
        .await;
    harness
        .broker
        .inject("bacon/v1/signal/agent/w1", r#"{"type":"wake"}"#);
    let delivered = harness
        .handler
        .wait_for_count(1, Duration::from_secs(1))
        .await;

    // Assert
    assert!(!active_during_backoff);
    assert!(resubscribed);
    assert!(delivered);
    assert!(harness.active.load(Ordering::SeqCst));
    assert_eq!(harness.handler.events()[0].0, "bacon/v1/signal/agent/w1");

    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failures_are_retried_after_backoff() {
    // Arrange
    let broker_failures = 3;
    let harness = {
        let harness = spawn_supervised(Duration::from_secs(2), "t/#");
        harness.broker.fail_next_subscribes(broker_failures);
        harness
    };

    // Act
    let started = tokio::time::Instant::now();
    let subscribed = harness
        .broker
        .wait_for_subscriptions(1, Duration::from_secs(60))
        .await;

    // Assert
    assert!(subscribed);
    assert_eq!(harness.broker.subscribe_attempts(), broker_failures + 1);
    assert!(started.elapsed() >= Duration::from_secs(6));

    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_stops_promptly() {
    // Arrange
    let harness = spawn_supervised(Duration::from_secs(300), "t/#");
    assert!(harness
        .broker
        .wait_for_subscriptions(1, Duration::from_secs(1))
        .await);

    // Act
    harness.broker.disconnect_all("gone");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let started = tokio::time::Instant::now();
    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();

    // Assert
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(harness.broker.subscribe_attempts(), 1);
    assert!(!harness.active.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_control_plane_survives_broker_bounce() {
    // Arrange
    let broker = Arc::new(InMemoryBroker::new());
    let store = memory_store();
    let client = bacon_mesh::TransportClient::new(broker.clone(), "hub");
    let mut plane = ControlPlane::new(client, store.clone(), &test_config());
    plane.start();
    assert!(broker.wait_for_subscriptions(2, Duration::from_secs(1)).await);

    // Act
    broker.disconnect_all("bounce");
    assert!(broker.wait_for_subscribe_attempts(4, Duration::from_secs(10)).await);
    assert!(broker.wait_for_subscriptions(2, Duration::from_secs(1)).await);
    broker.inject(
        &TopicBuilder::presence("a1"),
        presence_payload("a1", "n1", "online", "2025-06-01T10:00:00Z").to_string(),
    );
    broker.inject(
        &TopicBuilder::agent_signal("a1"),
        r#"{"type":"wake","source":"laptop"}"#,
    );
    for _ in 0..100 {
        if store.count_agents().unwrap() == 1 && store.count_messages().unwrap() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }

    // Assert
    assert_eq!(store.count_agents().unwrap(), 1);
    assert_eq!(store.count_messages().unwrap(), 1);

    plane.shutdown().await;
    assert_eq!(broker.active_subscriptions(), 0);
}
