use crate::error::MeshResult;
use crate::listener::EventHandler;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{SignalEvent, SignalRequest};
use crate::protocol::topics::TopicBuilder;
use crate::store::{DeliveryState, NewMessage, StateStore};
use crate::transport::{Broker, TransportClient};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Requester recorded for signals dispatched from this process
pub const CONTROL_PLANE_SENDER: &str = "control-plane";

/// Appends every observed signal to the message ledger
pub struct SignalLogger {
    store: Arc<StateStore>,
}

impl SignalLogger {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for SignalLogger {
    async fn handle(&self, topic: &str, payload: Value) -> MeshResult<()> {
        let signal = SignalEvent::resolve(topic, &payload);
        let row = NewMessage::delivered(&signal.sender, &signal.target, topic, payload.to_string());

        match self.store.append_message(&row) {
            Ok(id) => {
                metrics().record_signal_logged(true);
                info!(
                    id,
                    sender = %signal.sender,
                    target = %signal.target,
                    signal_type = signal.signal_type.as_deref().unwrap_or("-"),
                    "Logged signal"
                );
                Ok(())
            }
            Err(e) => {
                metrics().record_signal_logged(false);
                warn!(topic, sender = %signal.sender, error = %e, "Failed to log signal");
                Err(e.into())
            }
        }
    }
}

/// Result of dispatching a signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub id: i64,
    pub topic: String,
    pub state: DeliveryState,
}

/// Publishes signals and records them in the ledger
pub struct SignalDispatcher<B: Broker + ?Sized> {
    client: TransportClient<B>,
    store: Arc<StateStore>,
}

impl<B: Broker + ?Sized> SignalDispatcher<B> {
    pub fn new(client: TransportClient<B>, store: Arc<StateStore>) -> Self {
        Self { client, store }
    }

    /// Publish `request` to the target's direct inbox
    /// `bacon/v1/signal/agent/<target>` and log the attempt.
    ///
    /// A failed publish still writes a row, with state `error`. Only a ledger
    /// failure is returned as `Err`.
    pub async fn send(&self, target: &str, request: &SignalRequest) -> MeshResult<DispatchOutcome> {
        let topic = TopicBuilder::agent_signal(target);
        let content = serde_json::to_value(request)?;

        let delivered = self.client.publish(&topic, content.clone(), "signal").await;
        let state = if delivered {
            DeliveryState::Delivered
        } else {
            DeliveryState::Error
        };

        let row = NewMessage::new(
            &request.requester,
            target,
            &topic,
            content.to_string(),
            state,
        );
        let id = self.store.append_message(&row)?;
        metrics().record_signal_sent();

        if delivered {
            info!(id, target, signal_type = %request.signal_type, "Signal sent");
        } else {
            warn!(id, target, signal_type = %request.signal_type, "Signal publish failed, logged as error");
        }
        Ok(DispatchOutcome { id, topic, state })
    }
}
