//! Keepalive hooks invoked while a wait is outstanding
//!
//! A wait reports a [`KeepaliveTick`] immediately and then once per interval
//! until it completes. Where the tick goes is up to the caller: nowhere, the
//! log, or an MQTT progress topic an external supervisor watches.

use crate::error::MeshResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub mod mqtt_reporter;
pub use mqtt_reporter::MqttKeepaliveReporter;

/// One liveness report from an outstanding wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveTick {
    /// 1-based tick number
    pub tick: u32,
    pub max_ticks: u32,
    pub elapsed_seconds: u64,
    pub topic: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl KeepaliveTick {
    pub fn new(tick: u32, max_ticks: u32, elapsed: Duration, topic: &str) -> Self {
        let elapsed_seconds = elapsed.as_secs();
        Self {
            tick,
            max_ticks,
            elapsed_seconds,
            topic: topic.to_string(),
            message: format!("Listening on {topic}... ({elapsed_seconds}s elapsed)"),
            timestamp: Utc::now(),
        }
    }
}

/// Number of ticks a wait of `timeout` emits at most, counting the immediate one.
/// Saturates at `u32::MAX` for absurdly long waits.
pub fn max_ticks(timeout: Duration, interval: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .saturating_add(1)
}

#[async_trait]
pub trait KeepaliveHook: Send + Sync {
    async fn report(&self, tick: &KeepaliveTick) -> MeshResult<()>;
}

/// Discards ticks
pub struct NoOpKeepalive;

#[async_trait]
impl KeepaliveHook for NoOpKeepalive {
    async fn report(&self, _tick: &KeepaliveTick) -> MeshResult<()> {
        Ok(())
    }
}

/// Writes ticks to the log at info level
pub struct LogKeepalive;

#[async_trait]
impl KeepaliveHook for LogKeepalive {
    async fn report(&self, tick: &KeepaliveTick) -> MeshResult<()> {
        info!(
            tick = tick.tick,
            max_ticks = tick.max_ticks,
            elapsed_seconds = tick.elapsed_seconds,
            topic = %tick.topic,
            "{}", tick.message
        );
        Ok(())
    }
}
