//! The long-running control plane: presence reconciler, signal logger and an
//! optional staleness sweep, each supervised and stopped through one watch.

use crate::config::MeshConfig;
use crate::listener::Supervisor;
use crate::observability::health::HealthServer;
use crate::protocol::topics::TopicBuilder;
use crate::reconciler::{sweep_stale_agents, PresenceReconciler, SignalDispatcher, SignalLogger};
use crate::shutdown::{interruptible_sleep, join_or_abort};
use crate::store::StateStore;
use crate::transport::{Broker, TransportClient};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct ControlPlane<B: Broker + ?Sized> {
    client: TransportClient<B>,
    store: Arc<StateStore>,
    supervisor: Supervisor,
    stale_after: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
    presence_active: Arc<AtomicBool>,
    signal_active: Arc<AtomicBool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl<B: Broker + ?Sized> ControlPlane<B> {
    pub fn new(client: TransportClient<B>, store: Arc<StateStore>, config: &MeshConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            store,
            supervisor: Supervisor::new(config.listener.backoff()),
            stale_after: config.presence.stale_after(),
            shutdown_tx,
            presence_active: Arc::new(AtomicBool::new(false)),
            signal_active: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Receiver that flips to true when [`shutdown`](Self::shutdown) starts
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn presence_active(&self) -> Arc<AtomicBool> {
        self.presence_active.clone()
    }

    pub fn signal_active(&self) -> Arc<AtomicBool> {
        self.signal_active.clone()
    }

    pub fn dispatcher(&self) -> SignalDispatcher<B> {
        SignalDispatcher::new(self.client.clone(), self.store.clone())
    }

    /// Health server wired to both listener flags and the store
    pub fn health_server(&self, node_id: &str, port: u16) -> HealthServer {
        HealthServer::new(node_id, port, self.store.clone())
            .with_listener("presence", self.presence_active.clone())
            .with_listener("signal", self.signal_active.clone())
    }

    /// Spawn the supervised listeners and, if configured, the sweep
    pub fn start(&mut self) {
        let presence = {
            let supervisor = self.supervisor.clone();
            let broker = self.client.broker().clone();
            let handler = PresenceReconciler::new(self.store.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            let active = self.presence_active.clone();
            tokio::spawn(async move {
                supervisor
                    .run(broker, TopicBuilder::presence_pattern(), handler, shutdown_rx, active)
                    .await
            })
        };
        self.tasks.push(("presence-reconciler", presence));

        let signal = {
            let supervisor = self.supervisor.clone();
            let broker = self.client.broker().clone();
            let handler = SignalLogger::new(self.store.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            let active = self.signal_active.clone();
            tokio::spawn(async move {
                supervisor
                    .run(broker, TopicBuilder::signal_pattern(), handler, shutdown_rx, active)
                    .await
            })
        };
        self.tasks.push(("signal-logger", signal));

        if let Some(stale_after) = self.stale_after {
            let sweep = spawn_stale_sweep(self.store.clone(), stale_after, self.shutdown_tx.subscribe());
            self.tasks.push(("stale-sweep", sweep));
        }

        info!(
            endpoint = %self.client.broker().endpoint(),
            stale_sweep = self.stale_after.is_some(),
            "Control plane started"
        );
    }

    /// Signal every task to stop and wait for them, aborting stragglers
    pub async fn shutdown(mut self) {
        info!("Control plane shutting down");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks.drain(..) {
            join_or_abort(handle, name, SHUTDOWN_GRACE).await;
        }
        self.client.broker().close().await;
        info!("Control plane stopped");
    }
}

fn spawn_stale_sweep(
    store: Arc<StateStore>,
    stale_after: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = stale_after.min(MAX_SWEEP_PERIOD);
    tokio::spawn(async move {
        info!(stale_after_secs = stale_after.as_secs(), "Stale sweep enabled");
        while interruptible_sleep(&mut shutdown_rx, period).await {
            if let Err(e) = sweep_stale_agents(&store, stale_after) {
                error!(error = %e, "Stale sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::InMemoryBroker;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_start_subscribes_both_patterns() {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut plane = ControlPlane::new(
            TransportClient::new(broker.clone(), "hub"),
            store,
            &MeshConfig::test_config(),
        );

        plane.start();
        assert!(broker.wait_for_subscriptions(2, Duration::from_secs(1)).await);

        let presence = plane.presence_active();
        let signal = plane.signal_active();
        assert!(presence.load(Ordering::SeqCst));
        assert!(signal.load(Ordering::SeqCst));

        plane.shutdown().await;
        assert_eq!(broker.active_subscriptions(), 0);
        assert!(!presence.load(Ordering::SeqCst));
    }
}
