//! State store persistence on a real database file

use bacon_mesh::protocol::PresenceEvent;
use bacon_mesh::store::{DeliveryState, NewMessage, SLEEPING};
use bacon_mesh::StateStore;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

fn event(agent_id: &str, node_id: &str, state: &str, minute: u32) -> PresenceEvent {
    PresenceEvent::from_payload(&json!({
        "agent_id": agent_id,
        "node_id": node_id,
        "state": state,
        "ts": format!("2025-06-01T10:{minute:02}:00Z"),
        "meta": {"role": "worker", "os": "linux"},
        "capabilities": ["wake"]
    }))
    .unwrap()
}

#[test]
fn test_rows_survive_reopen() {
    // Arrange
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bacon.db");

    // Act
    {
        let store = StateStore::open(&path).unwrap();
        store.apply_presence(&event("a1", "n1", "online", 0)).unwrap();
        store
            .append_message(&NewMessage::delivered("cli", "a1", "bacon/v1/signal/a1", "{}"))
            .unwrap();
    }
    let reopened = StateStore::open(&path).unwrap();

    // Assert
    assert_eq!(reopened.count_nodes().unwrap(), 1);
    assert_eq!(reopened.count_agents().unwrap(), 1);
    assert_eq!(reopened.count_messages().unwrap(), 1);
    assert!(reopened.ping().is_ok());
}

#[test]
fn test_apply_presence_reports_created_rows() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("bacon.db")).unwrap();

    let first = store.apply_presence(&event("a1", "n1", "online", 0)).unwrap();
    let sibling = store.apply_presence(&event("a2", "n1", "online", 1)).unwrap();
    let repeat = store.apply_presence(&event("a1", "n1", "busy", 2)).unwrap();

    assert!(first.node_created && first.agent_created);
    assert!(!sibling.node_created && sibling.agent_created);
    assert!(!repeat.node_created && !repeat.agent_created);
}

#[test]
fn test_list_agents_newest_first() {
    let store = StateStore::open_in_memory().unwrap();
    store.apply_presence(&event("early", "n1", "online", 0)).unwrap();
    store.apply_presence(&event("late", "n2", "online", 30)).unwrap();
    store.apply_presence(&event("middle", "n1", "online", 15)).unwrap();

    let ids: Vec<String> = store
        .list_agents()
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();

    assert_eq!(ids, vec!["late", "middle", "early"]);
    assert_eq!(store.list_nodes().unwrap().len(), 2);
}

#[test]
fn test_mark_stale_is_idempotent() {
    let store = StateStore::open_in_memory().unwrap();
    store.apply_presence(&event("a1", "n1", "online", 0)).unwrap();
    store.apply_presence(&event("a2", "n1", "online", 45)).unwrap();
    let cutoff = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap();

    let first = store.mark_stale_agents(cutoff).unwrap();
    let second = store.mark_stale_agents(cutoff).unwrap();
    let far_past = store.mark_stale_agents(cutoff - Duration::days(365)).unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 0);
    assert_eq!(far_past, 0);
    assert_eq!(store.get_agent("a1").unwrap().unwrap().status, SLEEPING);
    assert_eq!(store.get_agent("a2").unwrap().unwrap().status, "online");
}

#[test]
fn test_ledger_states_round_trip() {
    let store = StateStore::open_in_memory().unwrap();
    for state in [
        DeliveryState::Delivered,
        DeliveryState::Pending,
        DeliveryState::Error,
    ] {
        store
            .append_message(&NewMessage::new("cp", "a1", "bacon/v1/signal/a1", "{}", state))
            .unwrap();
    }

    let states: Vec<DeliveryState> = store
        .message_history()
        .unwrap()
        .into_iter()
        .map(|r| r.state)
        .collect();

    assert_eq!(
        states,
        vec![
            DeliveryState::Delivered,
            DeliveryState::Pending,
            DeliveryState::Error
        ]
    );
}

#[test]
fn test_missing_node_fields_fall_back() {
    let store = StateStore::open_in_memory().unwrap();
    let bare = PresenceEvent::from_payload(&json!({"agent_id": "a1", "node_id": "n1"})).unwrap();

    store.apply_presence(&bare).unwrap();

    let node = store.get_node("n1").unwrap().unwrap();
    assert_eq!(node.hostname, "n1");
    assert_eq!(node.os, "unknown");
    assert!(node.capabilities.is_empty());
    let agent = store.get_agent("a1").unwrap().unwrap();
    assert_eq!(agent.status, "unknown");
    assert_eq!(agent.role, "unknown");
}
