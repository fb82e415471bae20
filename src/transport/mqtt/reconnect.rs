//! Reconnect policy decisions for the persistent publisher
//!
//! Pure functions over [`ConnectionState`]; the supervisor loop in
//! `persistent` only performs the I/O they decide on.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// What the supervisor does after a failed poll
#[derive(Debug, PartialEq)]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    Stop(StopReason),
}

#[derive(Debug, PartialEq)]
pub enum StopReason {
    Shutdown,
    AttemptsExhausted,
}

/// Things that happen to the publisher's link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Acknowledged,
    ClosedByBroker,
    Failed(String),
    Retrying(u32),
    GaveUp(String),
}

pub fn next_step(attempts_so_far: u32, policy: &ReconnectConfig, shutting_down: bool) -> ReconnectStep {
    if shutting_down {
        return ReconnectStep::Stop(StopReason::Shutdown);
    }
    if policy.max_attempts.is_some_and(|max| attempts_so_far >= max) {
        return ReconnectStep::Stop(StopReason::AttemptsExhausted);
    }

    let attempt = attempts_so_far + 1;
    ReconnectStep::Retry {
        attempt,
        delay: Duration::from_millis(policy.calculate_backoff_delay(attempt)),
    }
}

/// How long the initial connect may take: the connect timeout plus, for a
/// bounded policy, every backoff delay it could sleep through
pub fn connect_deadline(policy: &ReconnectConfig, connect_timeout: Duration) -> Duration {
    policy
        .calculate_max_total_time()
        .map_or(connect_timeout, |ms| connect_timeout + Duration::from_millis(ms))
}

pub fn state_after(event: LinkEvent) -> ConnectionState {
    match event {
        LinkEvent::Acknowledged => ConnectionState::Connected,
        LinkEvent::ClosedByBroker => ConnectionState::Disconnected("Broker disconnected".to_string()),
        LinkEvent::Failed(reason) => ConnectionState::Disconnected(reason),
        LinkEvent::Retrying(attempt) => ConnectionState::Reconnecting(attempt),
        LinkEvent::GaveUp(reason) => ConnectionState::PermanentlyDisconnected(reason),
    }
}

pub fn accepts_publishes(state: &ConnectionState) -> bool {
    *state == ConnectionState::Connected
}

pub fn log_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(attempt, "MQTT publisher reconnected");
        }
        (_, ConnectionState::Connected) => info!("MQTT publisher connected"),
        (_, ConnectionState::Disconnected(reason)) => warn!(%reason, "MQTT publisher link lost"),
        (_, ConnectionState::PermanentlyDisconnected(reason)) => {
            error!(%reason, "MQTT publisher gave up");
        }
        _ => {}
    }
}
