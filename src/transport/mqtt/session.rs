//! Per-call MQTT broker: one connection per publish, one per subscription

use super::connection::{configure_mqtt_options, BrokerAddress};
use super::events::{classify, SessionEvent};
use crate::config::BrokerSection;
use crate::transport::{Broker, InboundMessage, Subscription, TransportError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound on flushing DISCONNECT after a publish
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Request channel capacity for short-lived clients
const REQUEST_CAPACITY: usize = 10;

pub struct MqttBroker {
    client_prefix: String,
    config: BrokerSection,
}

impl MqttBroker {
    pub fn new(client_prefix: impl Into<String>, config: BrokerSection) -> Result<Self, TransportError> {
        BrokerAddress::parse(&config.broker_url)?;
        Ok(Self {
            client_prefix: client_prefix.into(),
            config,
        })
    }

    pub fn config(&self) -> &BrokerSection {
        &self.config
    }

    fn open(&self) -> Result<(AsyncClient, EventLoop), TransportError> {
        let options = configure_mqtt_options(&self.client_prefix, &self.config)?;
        Ok(AsyncClient::new(options, REQUEST_CAPACITY))
    }

    /// Open a dedicated subscription connection
    pub async fn open_subscription(&self, filter: &str) -> Result<MqttSubscription, TransportError> {
        let (client, mut event_loop) = self.open()?;
        let timeout = self.config.connect_timeout();
        let mut buffered = VecDeque::new();

        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        drive_until(&mut event_loop, timeout, "connect", &mut buffered, |event| {
            *event == SessionEvent::Connected
        })
        .await?;
        drive_until(&mut event_loop, timeout, "subscribe", &mut buffered, |event| {
            *event == SessionEvent::Subscribed
        })
        .await
        .map_err(|e| TransportError::SubscriptionFailed(e.to_string()))?;

        debug!(filter, "Subscription established");
        Ok(MqttSubscription {
            filter: filter.to_string(),
            _client: client,
            event_loop,
            buffered,
        })
    }
}

#[async_trait::async_trait]
impl Broker for MqttBroker {
    /// Connect, wait for ConnAck, publish at QoS 1, wait for PubAck, disconnect.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let (client, mut event_loop) = self.open()?;
        let timeout = self.config.connect_timeout();
        let mut ignored = VecDeque::new();

        drive_until(&mut event_loop, timeout, "connect", &mut ignored, |event| {
            *event == SessionEvent::Connected
        })
        .await?;

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        drive_until(&mut event_loop, timeout, "publish", &mut ignored, |event| {
            *event == SessionEvent::PublishAcked
        })
        .await
        .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        let _ = client.disconnect().await;
        drop(client);
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while event_loop.poll().await.is_ok() {}
        })
        .await;

        trace!(topic, "Published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<Box<dyn Subscription>, TransportError> {
        Ok(Box::new(self.open_subscription(filter).await?))
    }

    fn endpoint(&self) -> String {
        self.config.broker_url.clone()
    }
}

/// A subscription that owns its own connection
pub struct MqttSubscription {
    filter: String,
    // Keeps the request channel open for the lifetime of the subscription
    _client: AsyncClient,
    event_loop: EventLoop,
    buffered: VecDeque<InboundMessage>,
}

#[async_trait::async_trait]
impl Subscription for MqttSubscription {
    fn filter(&self) -> &str {
        &self.filter
    }

    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        if let Some(message) = self.buffered.pop_front() {
            return Ok(Some(message));
        }

        loop {
            let event = self
                .event_loop
                .poll()
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;

            match classify(&event) {
                SessionEvent::Message(message) => return Ok(Some(message)),
                SessionEvent::Disconnected => {
                    return Err(TransportError::ConnectionLost(
                        "Broker sent DISCONNECT".to_string(),
                    ))
                }
                _ => continue,
            }
        }
    }
}

/// Poll until `accept` matches a classified event. Messages seen on the way are buffered.
async fn drive_until<F>(
    event_loop: &mut EventLoop,
    timeout: Duration,
    stage: &'static str,
    buffered: &mut VecDeque<InboundMessage>,
    mut accept: F,
) -> Result<(), TransportError>
where
    F: FnMut(&SessionEvent) -> bool + Send,
{
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("{stage}: {e}")))?;

            let event = classify(&event);
            if accept(&event) {
                return Ok(());
            }
            match event {
                SessionEvent::Message(message) => buffered.push_back(message),
                SessionEvent::Disconnected => {
                    return Err(TransportError::ConnectionLost(format!(
                        "Broker disconnected during {stage}"
                    )))
                }
                _ => {}
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(TransportError::ConnectionFailed(format!(
            "{stage} timed out after {timeout:?}"
        )))
    })
}
