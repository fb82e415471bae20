use crate::error::MeshResult;
use crate::listener::EventHandler;
use crate::observability::metrics::metrics;
use crate::protocol::messages::PresenceEvent;
use crate::store::{StateStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keeps node and agent rows current from presence events.
///
/// Last write wins: every well-formed event overwrites the agent's status and
/// last_seen, whatever their previous values. Malformed events are dropped.
pub struct PresenceReconciler {
    store: Arc<StateStore>,
}

impl PresenceReconciler {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for PresenceReconciler {
    async fn handle(&self, topic: &str, payload: Value) -> MeshResult<()> {
        let event = match PresenceEvent::from_payload(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic, error = %e, "Dropping malformed presence event");
                metrics().record_presence_dropped();
                return Ok(());
            }
        };

        let span = crate::presence_span!(operation = "apply", agent_id = %event.agent_id, node_id = %event.node_id);
        let _guard = span.enter();

        let outcome = self.store.apply_presence(&event)?;
        metrics().record_presence_applied(outcome.node_created, outcome.agent_created);

        if outcome.node_created {
            info!(node_id = %event.node_id, "Discovered node");
        }
        if outcome.agent_created {
            info!(agent_id = %event.agent_id, state = %event.state, "Discovered agent");
        } else {
            debug!(agent_id = %event.agent_id, state = %event.state, "Refreshed agent");
        }
        Ok(())
    }
}

/// Mark agents silent for longer than `stale_after` as sleeping
pub fn sweep_stale_agents(store: &StateStore, stale_after: Duration) -> StoreResult<usize> {
    let cutoff = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let marked = store.mark_stale_agents(cutoff)?;
    if marked > 0 {
        info!(marked, stale_after_secs = stale_after.as_secs(), "Marked stale agents as sleeping");
        metrics().record_agents_marked_stale(marked);
    }
    Ok(marked)
}
