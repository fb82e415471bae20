//! bacon-mesh command line
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use bacon_mesh::announce::{PresenceAnnouncer, ONLINE};
use bacon_mesh::config::MeshConfig;
use bacon_mesh::observability::{init_default_logging, metrics::metrics};
use bacon_mesh::progress::{KeepaliveHook, LogKeepalive, MqttKeepaliveReporter};
use bacon_mesh::protocol::messages::SignalRequest;
use bacon_mesh::reconciler::{SignalDispatcher, CONTROL_PLANE_SENDER};
use bacon_mesh::transport::mqtt::connect_broker;
use bacon_mesh::{Broker, ChannelKind, ControlPlane, StateStore, TransportClient, WaitStatus};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "bacon-mesh")]
#[command(about = "Presence and wake coordination over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Where a topic-taking command points
#[derive(Args)]
struct TopicArgs {
    /// Explicit topic or filter; overrides --target and --kind
    #[arg(long)]
    topic: Option<String>,

    /// Target id; defaults to this host
    #[arg(long)]
    target: Option<String>,

    /// Channel kind (data, presence, signal, or any other segment)
    #[arg(long, default_value = "data")]
    kind: String,
}

impl TopicArgs {
    fn resolve<B: Broker + ?Sized>(&self, client: &TransportClient<B>) -> String {
        match &self.topic {
            Some(topic) => topic.clone(),
            None => client.topic(self.target.as_deref(), &ChannelKind::parse(&self.kind)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: presence reconciler, signal logger, health server
    Run,
    /// Block until one message arrives, emitting keepalive ticks
    Wait {
        #[command(flatten)]
        topic: TopicArgs,

        /// Seconds to wait; defaults to [wait] default_timeout_secs
        #[arg(long)]
        timeout: Option<u64>,

        /// Publish keepalive ticks to bacon/v1/progress/<node> instead of logging them
        #[arg(long)]
        progress: bool,
    },
    /// Poll briefly for a message without blocking
    Check {
        #[command(flatten)]
        topic: TopicArgs,

        /// Poll window in milliseconds; defaults to [wait] check_timeout_ms
        #[arg(long)]
        window_ms: Option<u64>,
    },
    /// Publish one enveloped message
    Send {
        #[command(flatten)]
        topic: TopicArgs,

        /// Envelope type; defaults to the channel kind
        #[arg(long = "type")]
        message_type: Option<String>,

        /// Message body; parsed as JSON when possible
        message: String,
    },
    /// Send a signal to an agent and record it in the ledger
    Signal {
        /// Target agent id
        target: String,

        #[arg(long = "type", default_value = "wake")]
        signal_type: String,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long, default_value = "normal")]
        priority: String,

        #[arg(long, default_value = CONTROL_PLANE_SENDER)]
        requester: String,
    },
    /// Publish this node's presence
    Announce {
        /// Agent id; defaults to the node id
        #[arg(long)]
        agent_id: Option<String>,

        #[arg(long, default_value = ONLINE)]
        state: String,

        #[arg(long)]
        parent_id: Option<String>,

        /// Keep republishing every heartbeat interval until interrupted
        #[arg(long)]
        repeat: bool,
    },
    /// List known agents, most recently seen first
    Agents,
    /// Show the message ledger
    History {
        /// Newest rows to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Full ledger, oldest first
        #[arg(long)]
        all: bool,
    },
    /// Show identity, broker and store summary
    Status,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match MeshConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_control_plane(config).await,
        Commands::Wait {
            topic,
            timeout,
            progress,
        } => wait_command(config, topic, timeout, progress).await,
        Commands::Check { topic, window_ms } => check_command(config, topic, window_ms).await,
        Commands::Send {
            topic,
            message_type,
            message,
        } => send_command(config, topic, message_type, message).await,
        Commands::Signal {
            target,
            signal_type,
            reason,
            priority,
            requester,
        } => {
            let request = SignalRequest::new(signal_type, requester, priority, reason);
            signal_command(config, target, request).await
        }
        Commands::Announce {
            agent_id,
            state,
            parent_id,
            repeat,
        } => announce_command(config, agent_id, state, parent_id, repeat).await,
        Commands::Agents => agents_command(config),
        Commands::History { limit, all } => history_command(config, limit, all),
        Commands::Status => status_command(config).await,
        Commands::Config { show } => config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn client_for(config: &MeshConfig) -> CliResult<TransportClient<dyn Broker>> {
    let broker = connect_broker(&config.node.id, &config.broker).await?;
    Ok(TransportClient::new(broker, &config.node.transport_hostname())
        .with_keepalive_interval(config.wait.keepalive_interval()))
}

fn open_store(config: &MeshConfig) -> CliResult<Arc<StateStore>> {
    Ok(Arc::new(StateStore::open(&config.store.path)?))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> CliResult {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

async fn run_control_plane(config: MeshConfig) -> CliResult {
    info!(
        node_id = %config.node.id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting control plane"
    );

    let store = open_store(&config)?;
    let client = client_for(&config).await?;
    let mut plane = ControlPlane::new(client, store, &config);
    plane.start();

    let health_server = Arc::new(plane.health_server(&config.node.id, config.health.port));
    let health_shutdown = plane.shutdown_receiver();
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.start(health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    let signal_result = shutdown_signal().await;

    plane.shutdown().await;
    if let Err(e) = health_task.await {
        error!("Health server task failed: {}", e);
    }
    info!(metrics = ?serde_json::to_value(metrics().get_metrics()).ok(), "Final metrics");
    signal_result
}

async fn wait_command(
    config: MeshConfig,
    topic: TopicArgs,
    timeout: Option<u64>,
    progress: bool,
) -> CliResult {
    let client = client_for(&config).await?;
    let topic = topic.resolve(&client);
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.wait.default_timeout());

    let hook: Arc<dyn KeepaliveHook> = if progress {
        Arc::new(MqttKeepaliveReporter::new(
            config.node.id.clone(),
            client.broker().clone(),
        ))
    } else {
        Arc::new(LogKeepalive)
    };

    let outcome = client.wait_for_message(&topic, timeout, hook).await;
    client.broker().close().await;
    print_json(&outcome)?;

    if outcome.status == WaitStatus::Error {
        process::exit(1);
    }
    Ok(())
}

async fn check_command(config: MeshConfig, topic: TopicArgs, window_ms: Option<u64>) -> CliResult {
    let client = client_for(&config).await?;
    let topic = topic.resolve(&client);
    let window = window_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.wait.check_timeout());

    let outcome = client.check_messages(&topic, window).await;
    client.broker().close().await;
    print_json(&outcome)
}

async fn send_command(
    config: MeshConfig,
    topic: TopicArgs,
    message_type: Option<String>,
    message: String,
) -> CliResult {
    let client = client_for(&config).await?;
    let resolved = topic.resolve(&client);
    let message_type = message_type.unwrap_or_else(|| topic.kind.clone());
    let content = serde_json::from_str::<Value>(&message).unwrap_or(Value::String(message));

    let published = client.publish(&resolved, content, &message_type).await;
    client.broker().close().await;
    print_json(&json!({ "published": published, "topic": resolved }))?;

    if !published {
        return Err(format!("Failed to publish to {resolved}").into());
    }
    Ok(())
}

async fn signal_command(config: MeshConfig, target: String, request: SignalRequest) -> CliResult {
    let store = open_store(&config)?;
    let client = client_for(&config).await?;
    let dispatcher = SignalDispatcher::new(client.clone(), store);

    let outcome = dispatcher.send(&target, &request).await?;
    client.broker().close().await;
    print_json(&outcome)
}

async fn announce_command(
    config: MeshConfig,
    agent_id: Option<String>,
    state: String,
    parent_id: Option<String>,
    repeat: bool,
) -> CliResult {
    let client = client_for(&config).await?;
    let agent_id = agent_id.unwrap_or_else(|| config.node.id.clone());

    let mut announcer = PresenceAnnouncer::for_node(client.clone(), &config.node, &agent_id, &state);
    if parent_id.is_some() {
        let mut announcement = announcer.announcement().clone();
        announcement.parent_id = parent_id;
        announcer = PresenceAnnouncer::new(client.clone(), announcement);
    }

    if !announcer.announce_once().await {
        client.broker().close().await;
        return Err(format!("Failed to publish presence to {}", announcer.topic()).into());
    }
    print_json(&json!({ "published": true, "topic": announcer.topic() }))?;

    if repeat {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let heartbeat = Arc::new(announcer)
            .spawn_heartbeat(config.presence.heartbeat_interval(), shutdown_rx);

        let signal_result = shutdown_signal().await;
        let _ = shutdown_tx.send(true);
        if let Err(e) = heartbeat.await {
            error!("Heartbeat task failed: {}", e);
        }
        signal_result?;
    }

    client.broker().close().await;
    Ok(())
}

fn agents_command(config: MeshConfig) -> CliResult {
    let store = open_store(&config)?;
    print_json(&store.list_agents()?)
}

fn history_command(config: MeshConfig, limit: usize, all: bool) -> CliResult {
    let store = open_store(&config)?;
    let rows = if all {
        store.message_history()?
    } else {
        store.recent_messages(limit)?
    };
    print_json(&rows)
}

async fn status_command(config: MeshConfig) -> CliResult {
    let store = open_store(&config)?;
    let client = client_for(&config).await?;

    let status = json!({
        "node_id": config.node.id,
        "hostname": client.hostname(),
        "transport": client.status(),
        "inbox": client.topic(None, &ChannelKind::Data),
        "store": {
            "path": config.store.path,
            "nodes": store.count_nodes()?,
            "agents": store.count_agents()?,
            "messages": store.count_messages()?,
        },
    });
    client.broker().close().await;
    print_json(&status)
}

fn config_command(config: MeshConfig, show: bool) -> CliResult {
    if show {
        println!("{}", config.to_toml()?);
    }
    info!("Configuration validation complete");
    Ok(())
}
