//! Thread-safe metrics collection
//!
//! Atomic counters for transport traffic, presence reconciliation, signal
//! logging, waits and listener supervision. A single global collector is
//! exposed through [`metrics`]; the health server serializes its snapshot.

use crate::wait::WaitStatus;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Transport
    connected: AtomicBool,
    reconnect_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,

    // Presence
    presence_applied: AtomicU64,
    presence_dropped: AtomicU64,
    nodes_created: AtomicU64,
    agents_created: AtomicU64,
    agents_marked_stale: AtomicU64,

    // Signals
    signals_logged: AtomicU64,
    signal_log_failures: AtomicU64,
    signals_sent: AtomicU64,

    // Waits
    waits_received: AtomicU64,
    waits_timed_out: AtomicU64,
    waits_failed: AtomicU64,
    keepalive_ticks: AtomicU64,

    // Lifecycle
    listener_restarts: AtomicU64,
    heartbeats: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            presence_applied: AtomicU64::new(0),
            presence_dropped: AtomicU64::new(0),
            nodes_created: AtomicU64::new(0),
            agents_created: AtomicU64::new(0),
            agents_marked_stale: AtomicU64::new(0),
            signals_logged: AtomicU64::new(0),
            signal_log_failures: AtomicU64::new(0),
            signals_sent: AtomicU64::new(0),
            waits_received: AtomicU64::new(0),
            waits_timed_out: AtomicU64::new(0),
            waits_failed: AtomicU64::new(0),
            keepalive_ticks: AtomicU64::new(0),
            listener_restarts: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Transport metrics
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, success: bool) {
        if success {
            self.messages_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Presence metrics
    pub fn record_presence_applied(&self, node_created: bool, agent_created: bool) {
        self.presence_applied.fetch_add(1, Ordering::Relaxed);
        if node_created {
            self.nodes_created.fetch_add(1, Ordering::Relaxed);
        }
        if agent_created {
            self.agents_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_presence_dropped(&self) {
        self.presence_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agents_marked_stale(&self, count: usize) {
        self.agents_marked_stale
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    // Signal metrics
    pub fn record_signal_logged(&self, success: bool) {
        if success {
            self.signals_logged.fetch_add(1, Ordering::Relaxed);
        } else {
            self.signal_log_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_signal_sent(&self) {
        self.signals_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Wait metrics
    pub fn record_wait(&self, status: WaitStatus) {
        let counter = match status {
            WaitStatus::Received => &self.waits_received,
            WaitStatus::Timeout => &self.waits_timed_out,
            WaitStatus::Error => &self.waits_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive_tick(&self) {
        self.keepalive_ticks.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn record_listener_restart(&self) {
        self.listener_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.connected.store(false, Ordering::Relaxed);
        for counter in [
            &self.reconnect_attempts,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.presence_applied,
            &self.presence_dropped,
            &self.nodes_created,
            &self.agents_created,
            &self.agents_marked_stale,
            &self.signals_logged,
            &self.signal_log_failures,
            &self.signals_sent,
            &self.waits_received,
            &self.waits_timed_out,
            &self.waits_failed,
            &self.keepalive_ticks,
            &self.listener_restarts,
            &self.heartbeats,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            transport: TransportMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                reconnect_attempts: load(&self.reconnect_attempts),
                messages_published: load(&self.messages_published),
                publish_failures: load(&self.publish_failures),
                messages_received: load(&self.messages_received),
            },
            presence: PresenceMetrics {
                applied: load(&self.presence_applied),
                dropped: load(&self.presence_dropped),
                nodes_created: load(&self.nodes_created),
                agents_created: load(&self.agents_created),
                agents_marked_stale: load(&self.agents_marked_stale),
            },
            signals: SignalMetrics {
                logged: load(&self.signals_logged),
                log_failures: load(&self.signal_log_failures),
                sent: load(&self.signals_sent),
            },
            waits: WaitMetrics {
                received: load(&self.waits_received),
                timed_out: load(&self.waits_timed_out),
                failed: load(&self.waits_failed),
                keepalive_ticks: load(&self.keepalive_ticks),
            },
            lifecycle: LifecycleMetrics {
                uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
                listener_restarts: load(&self.listener_restarts),
                heartbeats: load(&self.heartbeats),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub transport: TransportMetrics,
    pub presence: PresenceMetrics,
    pub signals: SignalMetrics,
    pub waits: WaitMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct TransportMetrics {
    pub connected: bool,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
}

#[derive(Debug, Serialize)]
pub struct PresenceMetrics {
    pub applied: u64,
    pub dropped: u64,
    pub nodes_created: u64,
    pub agents_created: u64,
    pub agents_marked_stale: u64,
}

#[derive(Debug, Serialize)]
pub struct SignalMetrics {
    pub logged: u64,
    pub log_failures: u64,
    pub sent: u64,
}

#[derive(Debug, Serialize)]
pub struct WaitMetrics {
    pub received: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub keepalive_ticks: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub uptime_seconds: u64,
    pub listener_restarts: u64,
    pub heartbeats: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
