//! Long-lived MQTT publisher behind the [`Broker`] trait
//!
//! One client publishes for the life of the process; a supervisor task drives
//! its event loop and reconnects with the configured backoff. Subscriptions
//! still get a dedicated connection each, via [`MqttBroker`].

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::events::{classify, SessionEvent};
use super::reconnect::{self, LinkEvent, ReconnectStep, StopReason};
use super::session::MqttBroker;
use crate::config::BrokerSection;
use crate::observability::metrics::metrics;
use crate::shutdown::{interruptible_sleep, stop_task};
use crate::transport::{Broker, Subscription, TransportError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const GRACEFUL_STOP: Duration = Duration::from_secs(2);

pub struct PersistentMqttBroker {
    subscriptions: MqttBroker,
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentMqttBroker {
    /// Start the supervised publisher and wait for the first ConnAck
    pub async fn connect(
        client_prefix: &str,
        config: BrokerSection,
        policy: ReconnectConfig,
    ) -> Result<Self, TransportError> {
        let subscriptions = MqttBroker::new(client_prefix, config.clone())?;
        let options = configure_mqtt_options(&format!("{client_prefix}-pub"), &config)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timeout = reconnect::connect_deadline(&policy, config.connect_timeout());

        let handle = tokio::spawn(supervise(event_loop, state_tx, shutdown_rx, policy));

        if let Err(e) = wait_for_connection_confirmation(state_rx.clone(), timeout).await {
            let _ = shutdown_tx.send(true);
            stop_task(handle, "mqtt-publisher").await;
            return Err(e);
        }

        Ok(Self {
            subscriptions,
            client,
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait::async_trait]
impl Broker for PersistentMqttBroker {
    /// Queue a QoS 1 publish on the shared session. Redelivery until PubAck is
    /// handled by the session, including across reconnects.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let state = self.state_rx.borrow().clone();
        if !reconnect::accepts_publishes(&state) {
            return Err(TransportError::NotConnected { state });
        }

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, filter: &str) -> Result<Box<dyn Subscription>, TransportError> {
        self.subscriptions.subscribe(filter).await
    }

    fn endpoint(&self) -> String {
        self.subscriptions.endpoint()
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        Some(self.state_rx.borrow().clone())
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to send DISCONNECT");
        }

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(GRACEFUL_STOP, &mut handle).await.is_err() {
                warn!("Publisher supervisor did not stop in time, aborting");
                stop_task(handle, "mqtt-publisher").await;
            }
        }
        info!("MQTT publisher closed");
    }
}

fn transition(state_tx: &watch::Sender<ConnectionState>, event: LinkEvent) {
    let next = reconnect::state_after(event);
    let previous = state_tx.send_replace(next.clone());
    if previous != next {
        reconnect::log_transition(&previous, &next);
    }
}

async fn supervise(
    mut event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    policy: ReconnectConfig,
) {
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            polled = event_loop.poll() => match polled {
                Ok(event) => match classify(&event) {
                    SessionEvent::Connected => {
                        attempts = 0;
                        transition(&state_tx, LinkEvent::Acknowledged);
                    }
                    SessionEvent::Disconnected => transition(&state_tx, LinkEvent::ClosedByBroker),
                    _ => {}
                },
                Err(e) => {
                    transition(&state_tx, LinkEvent::Failed(e.to_string()));

                    let shutting_down = *shutdown_rx.borrow();
                    match reconnect::next_step(attempts, &policy, shutting_down) {
                        ReconnectStep::Retry { attempt, delay } => {
                            attempts = attempt;
                            metrics().record_reconnect_attempt();
                            transition(&state_tx, LinkEvent::Retrying(attempt));
                            // The event loop reconnects on its next poll
                            if !interruptible_sleep(&mut shutdown_rx, delay).await {
                                break;
                            }
                        }
                        ReconnectStep::Stop(StopReason::Shutdown) => break,
                        ReconnectStep::Stop(StopReason::AttemptsExhausted) => {
                            let reason = format!("Max reconnection attempts ({attempts}) exceeded");
                            error!(%reason, "Giving up on MQTT publisher");
                            transition(&state_tx, LinkEvent::GaveUp(reason));
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Wait until the state channel reports `Connected`
pub async fn wait_for_connection_confirmation(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
) -> Result<(), TransportError> {
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match &*state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::PermanentlyDisconnected(reason) => {
                    return Err(TransportError::ConnectionFailed(format!(
                        "Permanently disconnected: {reason}"
                    )))
                }
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::ConnectionFailed(
                    "State channel closed".to_string(),
                ));
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(TransportError::ConnectionFailed(
            "ConnAck timeout - no connection confirmation received".to_string(),
        ))
    })
}
