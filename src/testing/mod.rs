//! Test doubles for the broker and the callback seams
//!
//! Everything here runs in-process, so no test needs a live MQTT broker.
//!
//! ```
//! use bacon_mesh::testing::InMemoryBroker;
//! use bacon_mesh::TransportClient;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = Arc::new(InMemoryBroker::new());
//! let client = TransportClient::new(broker.clone(), "hub");
//!
//! assert!(client.publish("bacon/v1/data/laptop", json!("hi"), "data").await);
//! assert_eq!(broker.published_on("bacon/v1/data/laptop").len(), 1);
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
