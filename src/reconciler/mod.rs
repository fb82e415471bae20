//! Event handlers that fold broker traffic into the state store
//!
//! Handlers receive the store explicitly as an `Arc<StateStore>`; nothing here
//! reaches for process-global state beyond the metrics counters.

pub mod presence;
pub mod signal;

pub use presence::{sweep_stale_agents, PresenceReconciler};
pub use signal::{SignalDispatcher, SignalLogger, CONTROL_PLANE_SENDER};
