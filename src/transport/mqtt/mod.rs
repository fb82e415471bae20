//! MQTT v5 implementations of [`Broker`](crate::transport::Broker)
//!
//! - [`connection`] - option building and connection state (pure)
//! - [`events`] - classification of raw rumqttc events (pure)
//! - [`reconnect`] - publisher reconnect policy (pure)
//! - [`session`] - per-call broker, one connection per operation
//! - [`persistent`] - supervised long-lived publisher

pub mod connection;
pub mod events;
pub mod persistent;
pub mod reconnect;
pub mod session;

pub use connection::{configure_mqtt_options, BrokerAddress, ConnectionState, ReconnectConfig};
pub use events::{classify, SessionEvent};
pub use reconnect::{LinkEvent, ReconnectStep, StopReason};
pub use persistent::PersistentMqttBroker;
pub use session::{MqttBroker, MqttSubscription};

use crate::config::{BrokerMode, BrokerSection};
use crate::transport::{Broker, TransportError};
use std::sync::Arc;

/// Build the broker selected by `[broker] mode`
pub async fn connect_broker(
    client_prefix: &str,
    config: &BrokerSection,
) -> Result<Arc<dyn Broker>, TransportError> {
    match config.mode {
        BrokerMode::PerCall => Ok(Arc::new(MqttBroker::new(client_prefix, config.clone())?)),
        BrokerMode::Persistent => Ok(Arc::new(
            PersistentMqttBroker::connect(client_prefix, config.clone(), ReconnectConfig::default())
                .await?,
        )),
    }
}
