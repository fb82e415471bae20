//! Transport layer for the bacon namespace
//!
//! [`Broker`] is the seam between the mesh and a publish/subscribe router. The
//! production implementations live in [`mqtt`]; tests use the in-memory broker
//! from `testing::mocks`. [`TransportClient`] sits on top and owns the
//! envelope, topic and error-boundary conventions.

use bytes::Bytes;
use thiserror::Error;

pub mod client;
pub mod mqtt;

pub use client::{TransportClient, TransportStatus};
pub use mqtt::ConnectionState;

/// A message observed on a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Broker credentials unavailable: {0}")]
    Credentials(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Publish/subscribe router the mesh talks through.
///
/// Every publish is at-least-once. Implementations must be cheap to share
/// behind an `Arc`.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Open a subscription on a topic filter (`+` and `#` wildcards allowed).
    /// Returns once the broker has acknowledged the subscription.
    async fn subscribe(&self, filter: &str) -> Result<Box<dyn Subscription>, TransportError>;

    /// Human-readable broker address for status output
    fn endpoint(&self) -> String;

    /// State of a long-lived connection, `None` for per-call brokers
    fn connection_state(&self) -> Option<ConnectionState> {
        None
    }

    /// Release long-lived resources
    async fn close(&self) {}
}

/// A live subscription. Dropping it closes the underlying connection.
#[async_trait::async_trait]
pub trait Subscription: Send {
    fn filter(&self) -> &str;

    /// Next message in broker delivery order.
    /// `Ok(None)` means the subscription closed cleanly.
    async fn next_message(&mut self) -> Result<Option<InboundMessage>, TransportError>;
}
