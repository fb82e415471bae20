//! Bacon Monitor
//!
//! Tails traffic in the `bacon/v1` namespace with color-coded, highlighted
//! JSON payloads. Reconnects with exponential backoff when the broker drops.

use bacon_mesh::config::MeshConfig;
use bacon_mesh::protocol::{decode_payload, ChannelKind, NAMESPACE, VERSION};
use bacon_mesh::transport::mqtt::connect_broker;
use bacon_mesh::Broker;
use clap::Parser;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "bacon-monitor")]
#[command(about = "Monitor bacon mesh traffic")]
#[command(version)]
struct Args {
    /// Traffic to show
    #[arg(short, long, default_value = "all")]
    mode: MonitorMode,

    /// Output format
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Only show topics whose last segment equals this target
    #[arg(long)]
    target: Option<String>,

    /// Configuration file supplying the broker section
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the broker URL from configuration
    #[arg(long)]
    broker_url: Option<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum MonitorMode {
    /// Everything under bacon/v1
    All,
    /// Agent presence announcements
    Presence,
    /// Wake and control signals
    Signal,
    /// Data channel messages
    Data,
    /// Keepalive ticks from waiting nodes
    Progress,
}

impl MonitorMode {
    fn filter(self) -> String {
        match self {
            Self::All => format!("{NAMESPACE}/{VERSION}/#"),
            Self::Presence => format!("{NAMESPACE}/{VERSION}/presence/#"),
            Self::Signal => format!("{NAMESPACE}/{VERSION}/signal/#"),
            Self::Data => format!("{NAMESPACE}/{VERSION}/data/#"),
            Self::Progress => format!("{NAMESPACE}/{VERSION}/progress/#"),
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Color-coded with highlighted JSON
    Pretty,
    /// One line per message
    Compact,
    /// One JSON object per line
    Json,
}

const RESET: &str = "\x1b[0m";
const KEY_COLOR: &str = "\x1b[94m";
const STRING_COLOR: &str = "\x1b[92m";
const NUMBER_COLOR: &str = "\x1b[93m";
const BOOL_COLOR: &str = "\x1b[95m";
const NULL_COLOR: &str = "\x1b[90m";

fn kind_label(kind: Option<&ChannelKind>) -> String {
    kind.map(|k| k.as_str().to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn kind_color(kind: Option<&ChannelKind>) -> &'static str {
    match kind {
        Some(ChannelKind::Presence) => "\x1b[1;36m",
        Some(ChannelKind::Signal) => "\x1b[1;35m",
        Some(ChannelKind::Data) => "\x1b[1;32m",
        Some(ChannelKind::Other(k)) if k == "progress" => "\x1b[1;93m",
        Some(ChannelKind::Other(_)) => "\x1b[1;34m",
        None => "\x1b[0;37m",
    }
}

/// Render a JSON value indented, with ANSI colors per token class
fn highlight_json(value: &Value, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent + 1);
    let close_pad = "  ".repeat(indent);
    match value {
        Value::Null => {
            let _ = write!(out, "{NULL_COLOR}null{RESET}");
        }
        Value::Bool(b) => {
            let _ = write!(out, "{BOOL_COLOR}{b}{RESET}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{NUMBER_COLOR}{n}{RESET}");
        }
        Value::String(s) => {
            let _ = write!(out, "{STRING_COLOR}{}{RESET}", Value::String(s.clone()));
        }
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(items) => {
            out.push_str("[\n");
            for (i, item) in items.iter().enumerate() {
                out.push_str(&pad);
                highlight_json(item, indent + 1, out);
                out.push_str(if i + 1 < items.len() { ",\n" } else { "\n" });
            }
            let _ = write!(out, "{close_pad}]");
        }
        Value::Object(fields) if fields.is_empty() => out.push_str("{}"),
        Value::Object(fields) => {
            out.push_str("{\n");
            for (i, (key, item)) in fields.iter().enumerate() {
                let _ = write!(out, "{pad}{KEY_COLOR}{}{RESET}: ", Value::String(key.clone()));
                highlight_json(item, indent + 1, out);
                out.push_str(if i + 1 < fields.len() { ",\n" } else { "\n" });
            }
            let _ = write!(out, "{close_pad}}}");
        }
    }
}

fn format_message(topic: &str, payload: &Value, format: OutputFormat) -> String {
    let kind = ChannelKind::from_topic(topic);
    let timestamp = chrono::Utc::now().format("%H:%M:%S");

    match format {
        OutputFormat::Json => json!({
            "timestamp": timestamp.to_string(),
            "kind": kind.as_ref().map(ChannelKind::as_str),
            "topic": topic,
            "payload": payload,
        })
        .to_string(),
        OutputFormat::Compact => format!(
            "{timestamp} [{}] {topic} {payload}",
            kind_label(kind.as_ref())
        ),
        OutputFormat::Pretty => {
            let mut body = String::new();
            highlight_json(payload, 0, &mut body);
            format!(
                "{}[{}]{RESET} {timestamp} {topic}\n{body}\n",
                kind_color(kind.as_ref()),
                kind_label(kind.as_ref())
            )
        }
    }
}

fn matches_target(topic: &str, target: Option<&str>) -> bool {
    match target {
        Some(target) => topic.rsplit('/').next() == Some(target),
        None => true,
    }
}

/// Print messages from one subscription until it ends
async fn monitor_once(broker: &dyn Broker, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut subscription = broker.subscribe(&args.mode.filter()).await?;
    info!(filter = subscription.filter(), "Subscribed");

    while let Some(message) = subscription.next_message().await? {
        if !matches_target(&message.topic, args.target.as_deref()) {
            continue;
        }
        let payload = decode_payload(&message.payload);
        println!("{}", format_message(&message.topic, &payload, args.format));
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = MeshConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.broker_url {
        config.broker.broker_url = url.clone();
    }

    let client_prefix = format!("bacon-monitor-{}", std::process::id());
    let broker: Arc<dyn Broker> = connect_broker(&client_prefix, &config.broker).await?;

    println!("Bacon Mesh Monitor");
    println!("==================");
    println!("Mode: {:?} ({})", args.mode, args.mode.filter());
    println!("Format: {:?}", args.format);
    println!("Broker: {}", broker.endpoint());
    if let Some(target) = &args.target {
        println!("Target filter: {target}");
    }
    println!("Press Ctrl+C to stop monitoring");
    println!();

    let mut reconnect_delay = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            result = monitor_once(broker.as_ref(), &args) => {
                match result {
                    Ok(()) => {
                        warn!("Subscription closed");
                        reconnect_delay = Duration::from_secs(1);
                    }
                    Err(e) => error!("Monitor connection failed: {}", e),
                }
            }
        }

        warn!("Reconnecting in {} seconds...", reconnect_delay.as_secs());
        tokio::select! {
            _ = signal::ctrl_c() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }

    broker.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("bacon_monitor=info,bacon_mesh=info,rumqttc=warn")
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("Monitor failed: {}", e);
        std::process::exit(1);
    }
}
