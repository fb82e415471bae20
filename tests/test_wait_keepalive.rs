//! Wait-with-keepalive behavior under paused time
//!
//! Every test runs on a paused clock, so multi-minute waits finish instantly
//! and tick timing is exact.


use bacon_mesh::progress::NoOpKeepalive;
use bacon_mesh::testing::RecordingKeepalive;
use bacon_mesh::WaitStatus;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::memory_client;

const INBOX: &str = "bacon/v1/data/hub";

async fn settle_subscriptions(broker: &bacon_mesh::testing::InMemoryBroker) -> usize {
    for _ in 0..100 {
        if broker.active_subscriptions() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    broker.active_subscriptions()
}

#[tokio::test(start_paused = true)]
async fn test_short_timeout_returns_timeout_status() {
    // Arrange
    let (broker, client) = memory_client();

    // Act
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(3), Arc::new(NoOpKeepalive))
        .await;

    // Assert
    assert_eq!(outcome.status, WaitStatus::Timeout);
    assert_eq!(outcome.message, None);
    assert_eq!(outcome.topic, INBOX);
    assert!(outcome.elapsed >= Duration::from_secs(3));
    assert_eq!(broker.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_long_wait_emits_increasing_ticks() {
    // Arrange
    let (_broker, client) = memory_client();
    let client = client.with_keepalive_interval(Duration::from_secs(30));
    let hook = Arc::new(RecordingKeepalive::new());

    // Act
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(90), hook.clone())
        .await;

    // Assert
    assert_eq!(outcome.status, WaitStatus::Timeout);
    let ticks = hook.ticks();
    assert!(
        (3..=4).contains(&ticks.len()),
        "expected 3 or 4 ticks, got {}",
        ticks.len()
    );
    assert_eq!(ticks[0].tick, 1);
    assert_eq!(ticks[0].elapsed_seconds, 0);
    assert!(ticks.iter().all(|t| t.max_ticks == 4 && t.topic == INBOX));
    for pair in ticks.windows(2) {
        assert_eq!(pair[1].tick, pair[0].tick + 1);
        assert!(pair[1].elapsed_seconds > pair[0].elapsed_seconds);
    }
}

#[tokio::test(start_paused = true)]
async fn test_message_arriving_mid_wait_stops_ticks() {
    // Arrange
    let (broker, client) = memory_client();
    let client = client.with_keepalive_interval(Duration::from_secs(10));
    let hook = Arc::new(RecordingKeepalive::new());

    // Act
    let publisher = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            broker.inject(INBOX, r#"{"type":"data","content":"go"}"#);
        })
    };
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(600), hook.clone())
        .await;
    publisher.await.unwrap();
    let ticks_at_return = hook.count();
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert
    assert_eq!(outcome.status, WaitStatus::Received);
    assert_eq!(outcome.message, Some(json!({"type": "data", "content": "go"})));
    assert!(outcome.elapsed >= Duration::from_secs(25));
    assert_eq!(ticks_at_return, 3);
    assert_eq!(hook.count(), ticks_at_return);
}

#[tokio::test(start_paused = true)]
async fn test_wait_is_single_shot() {
    // Arrange
    let (broker, client) = memory_client();
    broker.inject(INBOX, "first");
    broker.inject(INBOX, "second");

    // Act
    let first = client
        .wait_for_message(INBOX, Duration::from_secs(5), Arc::new(NoOpKeepalive))
        .await;
    let second = client
        .wait_for_message(INBOX, Duration::from_secs(5), Arc::new(NoOpKeepalive))
        .await;

    // Assert
    assert_eq!(first.message, Some(json!("first")));
    assert_eq!(second.status, WaitStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_wait_releases_subscription() {
    // Arrange
    let (broker, client) = memory_client();
    let hook = Arc::new(RecordingKeepalive::new());

    // Act
    let abandoned = tokio::time::timeout(
        Duration::from_secs(45),
        client.wait_for_message(INBOX, Duration::from_secs(3600), hook.clone()),
    )
    .await;
    let remaining = settle_subscriptions(&broker).await;
    let ticks_after_drop = hook.count();
    tokio::time::sleep(Duration::from_secs(120)).await;

    // Assert
    assert!(abandoned.is_err());
    assert_eq!(remaining, 0);
    assert_eq!(hook.count(), ticks_after_drop);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_failure_yields_error_status() {
    // Arrange
    let (broker, client) = memory_client();
    broker.fail_next_subscribes(1);

    // Act
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(60), Arc::new(NoOpKeepalive))
        .await;

    // Assert
    assert_eq!(outcome.status, WaitStatus::Error);
    assert!(outcome.elapsed < Duration::from_secs(60));
    let reason = outcome.message.unwrap();
    assert!(reason.as_str().unwrap().contains("injected subscribe failure"));
}

#[tokio::test(start_paused = true)]
async fn test_connection_drop_mid_wait_yields_error_status() {
    let (broker, client) = memory_client();

    let dropper = {
        let broker = broker.clone();
        tokio::spawn(async move {
            assert!(broker.wait_for_subscriptions(1, Duration::from_secs(5)).await);
            broker.disconnect_all("broker restarted");
        })
    };
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(60), Arc::new(NoOpKeepalive))
        .await;
    dropper.await.unwrap();

    assert_eq!(outcome.status, WaitStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_failing_hook_does_not_abort_wait() {
    let (broker, client) = memory_client();
    let client = client.with_keepalive_interval(Duration::from_secs(10));
    let hook = Arc::new(RecordingKeepalive::failing());

    let publisher = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            broker.inject(INBOX, "done");
        })
    };
    let outcome = client
        .wait_for_message(INBOX, Duration::from_secs(120), hook.clone())
        .await;
    publisher.await.unwrap();

    assert_eq!(outcome.status, WaitStatus::Received);
    assert_eq!(hook.count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_check_messages_polls_briefly() {
    let (broker, client) = memory_client();

    let empty = client
        .check_messages(INBOX, Duration::from_millis(500))
        .await;
    broker.inject(INBOX, r#"{"n":1}"#);
    let found = client
        .check_messages(INBOX, Duration::from_millis(500))
        .await;

    assert!(!empty.has_message);
    assert_eq!(empty.error, None);
    assert!(found.has_message);
    assert_eq!(found.message, Some(json!({"n": 1})));
    assert_eq!(broker.active_subscriptions(), 0);
}
