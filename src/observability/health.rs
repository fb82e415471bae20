//! Health check HTTP server for container orchestration
//!
//! `/health` reports per-component checks, `/ready` is true once every
//! supervised listener holds a subscription and the store answers, `/live`
//! always answers, `/metrics` dumps the global collector.

use crate::observability::metrics::metrics;
use crate::store::StateStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub const HEALTHY: &str = "healthy";
pub const UNHEALTHY: &str = "unhealthy";

/// HTTP health check server
pub struct HealthServer {
    node_id: String,
    port: u16,
    store: Arc<StateStore>,
    listeners: Vec<(String, Arc<AtomicBool>)>,
}

impl HealthServer {
    pub fn new(node_id: impl Into<String>, port: u16, store: Arc<StateStore>) -> Self {
        Self {
            node_id: node_id.into(),
            port,
            store,
            listeners: Vec::new(),
        }
    }

    /// Track a listener's liveness flag under `name`
    pub fn with_listener(mut self, name: impl Into<String>, active: Arc<AtomicBool>) -> Self {
        self.listeners.push((name.into(), active));
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Per-component checks, keyed by component name
    pub fn checks(&self) -> BTreeMap<String, HealthCheck> {
        let now = current_timestamp();
        let mut checks = BTreeMap::new();

        let store = match self.store.ping() {
            Ok(()) => HealthCheck::healthy("State store reachable", now),
            Err(e) => HealthCheck::unhealthy(format!("State store unavailable: {e}"), now),
        };
        checks.insert("store".to_string(), store);

        for (name, active) in &self.listeners {
            let check = if active.load(Ordering::SeqCst) {
                HealthCheck::healthy("Subscribed", now)
            } else {
                HealthCheck::unhealthy("Not subscribed", now)
            };
            checks.insert(format!("listener:{name}"), check);
        }
        checks
    }

    pub fn health_status(&self) -> HealthStatus {
        let checks = self.checks();
        let healthy = checks.values().all(|check| check.status == HEALTHY);

        HealthStatus {
            status: if healthy { HEALTHY } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            node_id: self.node_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.checks().values().all(|check| check.status == HEALTHY)
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let with_server = warp::any().map(move || self.clone());

        // GET /health
        let health_route = warp::path("health")
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.health_status();
                let code = if status.status == HEALTHY {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        // GET /ready
        let ready_route = warp::path("ready")
            .and(warp::get())
            .and(with_server)
            .and_then(|server: Arc<HealthServer>| async move {
                let ready = server.is_ready();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            });

        // GET /live
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Component health checks"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
                ("/metrics", "Counters and uptime"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(root_route)
    }

    /// Serve until `shutdown_rx` flips to true
    pub async fn start(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let routes = self.routes();

        let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })?;

        tracing::info!(%bound, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: impl Into<String>, now: u64) -> Self {
        Self {
            status: HEALTHY.to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }

    fn unhealthy(message: impl Into<String>, now: u64) -> Self {
        Self {
            status: UNHEALTHY.to_string(),
            message: Some(message.into()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub node_id: String,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
