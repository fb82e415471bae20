//! Bacon Mesh
//!
//! Presence and wake coordination for long-lived agent processes spread over
//! several machines, built on an MQTT broker.
//!
//! # Overview
//!
//! - Topic namespace `bacon/v1/<kind>/<target>` and the publish envelope
//! - A per-call or persistent MQTT transport behind the [`Broker`] trait
//! - A single-shot wait that emits keepalive ticks while it blocks
//! - Supervised listeners that reconcile presence events into a SQLite store
//!   and append observed signals to a message ledger
//!
//! # Quick Start
//!
//! ```no_run
//! use bacon_mesh::config::MeshConfig;
//! use bacon_mesh::progress::LogKeepalive;
//! use bacon_mesh::transport::mqtt::connect_broker;
//! use bacon_mesh::{ChannelKind, TransportClient};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::load(None)?;
//! let broker = connect_broker(&config.node.id, &config.broker).await?;
//! let client = TransportClient::new(broker, &config.node.transport_hostname());
//!
//! // Block until something lands in this machine's inbox
//! let inbox = client.topic(None, &ChannelKind::Data);
//! let outcome = client
//!     .wait_for_message(&inbox, Duration::from_secs(60), Arc::new(LogKeepalive))
//!     .await;
//! println!("{}", serde_json::to_string(&outcome)?);
//! # Ok(())
//! # }
//! ```

pub mod announce;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod listener;
pub mod observability;
pub mod progress;
pub mod protocol;
pub mod reconciler;
pub mod shutdown;
pub mod store;
pub mod testing;
pub mod transport;
pub mod wait;

pub use config::MeshConfig;
pub use control_plane::ControlPlane;
pub use error::{MeshError, MeshResult};
pub use listener::{EventHandler, Supervisor};
pub use protocol::*;
pub use store::StateStore;
pub use transport::{Broker, InboundMessage, Subscription, TransportClient, TransportError};
pub use wait::{CheckOutcome, WaitOutcome, WaitStatus};
