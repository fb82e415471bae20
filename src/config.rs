//! Configuration for bacon mesh nodes
//!
//! Every section has defaults, so a node can run without a config file. When a
//! file is present it is read from `bacon.toml` or `config/bacon.toml` unless a
//! path is given explicitly. Credentials are never stored in the file; only the
//! names of the environment variables holding them.

use crate::protocol::topics::{local_hostname, normalize_hostname, validate_agent_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Files probed, in order, when no explicit config path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["bacon.toml", "config/bacon.toml"];

/// Environment override for `[store] path`
pub const DB_PATH_ENV: &str = "BACON_DB_PATH";

/// Environment override for `[health] port`
pub const HEALTH_PORT_ENV: &str = "HEALTH_PORT";

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeSection,
    pub broker: BrokerSection,
    pub wait: WaitSection,
    pub listener: ListenerSection,
    pub store: StoreSection,
    pub presence: PresenceSection,
    pub health: HealthSection,
}

/// Identity of this node on the mesh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeSection {
    /// Node identifier (must match [a-zA-Z0-9._-]+). Defaults to the hostname.
    pub id: String,
    /// Overrides the machine hostname used as envelope source and default
    /// topic target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub role: String,
    pub operator: Option<String>,
    pub capabilities: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: local_hostname(),
            hostname: None,
            role: "control-plane".to_string(),
            operator: None,
            capabilities: Vec::new(),
        }
    }
}

impl NodeSection {
    /// Hostname the transport speaks as. Independent of `id`.
    pub fn transport_hostname(&self) -> String {
        match self.hostname.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => normalize_hostname(host),
            _ => local_hostname(),
        }
    }
}

/// How the transport talks to the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// One broker connection per publish or subscription
    #[default]
    PerCall,
    /// One supervised long-lived connection for publishing
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub mode: BrokerMode,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            mode: BrokerMode::PerCall,
        }
    }
}

impl BrokerSection {
    /// Resolve the configured credential variables.
    ///
    /// Returns `None` when no username variable is configured. A configured
    /// variable that is not set is an error rather than a silent anonymous login.
    pub fn resolve_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let Some(username_env) = &self.username_env else {
            return Ok(None);
        };
        let username = get_env_var_required(username_env)?;
        let password = match &self.password_env {
            Some(password_env) => get_env_var_required(password_env)?,
            None => String::new(),
        };
        Ok(Some((username, password)))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WaitSection {
    pub keepalive_interval_secs: u64,
    pub default_timeout_secs: u64,
    pub check_timeout_ms: u64,
}

impl Default for WaitSection {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            default_timeout_secs: 3600,
            check_timeout_ms: 500,
        }
    }
}

impl WaitSection {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerSection {
    /// Fixed delay before a dead listener is restarted
    pub backoff_secs: u64,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self { backoff_secs: 5 }
    }
}

impl ListenerSection {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite file, or `:memory:`
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bacon.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceSection {
    pub heartbeat_interval_secs: u64,
    /// Agents silent for longer than this are marked `sleeping`. Unset disables the sweep.
    pub stale_after_secs: Option<u64>,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            stale_after_secs: None,
        }
    }
}

impl PresenceSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid node ID format: {0}")]
    InvalidNodeId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshConfig {
    /// Load configuration from a TOML file, apply env overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MeshConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else the first default path that exists,
    /// else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        match DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            Some(path) => Self::load_from_file(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Apply `BACON_DB_PATH` and `HEALTH_PORT` from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            self.store.path = PathBuf::from(path);
        }
        if let Some(port) = lookup(HEALTH_PORT_ENV) {
            self.health.port = port.trim().parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("{HEALTH_PORT_ENV} is not a valid port: {port}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_node_id(&self.node.id)?;
        if let Some(host) = self.node.hostname.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            validate_agent_id(&normalize_hostname(host)).map_err(|e| {
                ConfigError::InvalidConfig(format!("node.hostname '{host}' is not topic-safe ({e})"))
            })?;
        }
        validate_broker_url(&self.broker.broker_url)?;

        if self.wait.keepalive_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "wait.keepalive_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.presence.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "presence.heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.presence.stale_after_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "presence.stale_after_secs must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[node]
id = "test-node"
operator = "tester"
capabilities = ["wake"]

[broker]
broker_url = "mqtt://localhost:1883"

[store]
path = ":memory:"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

fn validate_node_id(node_id: &str) -> Result<(), ConfigError> {
    validate_agent_id(node_id).map_err(|e| {
        ConfigError::InvalidNodeId(format!(
            "Node ID '{node_id}' must match pattern [a-zA-Z0-9._-]+ ({e})"
        ))
    })
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("Invalid broker URL '{broker_url}': {e}")))?;

    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "Unsupported broker URL scheme '{other}' (expected mqtt, mqtts, tcp or ssl)"
        ))),
    }
}
