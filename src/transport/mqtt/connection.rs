//! Pure connection state and option building for MQTT sessions

use crate::config::BrokerSection;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use url::Url;

/// Connection state of a long-lived MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection policy for the persistent publisher
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff steps in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![250, 500, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Total time spent backing off across every attempt, `None` when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Host and port extracted from a broker URL
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(broker_url)
            .map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = matches!(url.scheme(), "mqtts" | "ssl");
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

/// Unique client id so per-call connections never collide at the broker
pub fn client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("bacon-{prefix}-{}", &suffix[..8])
}

/// Build MQTT options for one connection
pub fn configure_mqtt_options(
    client_prefix: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, TransportError> {
    let address = BrokerAddress::parse(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id(client_prefix), address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    let credentials = config
        .resolve_credentials()
        .map_err(|e| TransportError::Credentials(e.to_string()))?;
    if let Some((username, password)) = credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.calculate_backoff_delay(1), 250);
        assert_eq!(config.calculate_backoff_delay(4), 2500);
        assert_eq!(config.calculate_backoff_delay(5), 5000);
        assert_eq!(config.calculate_backoff_delay(100), 5000);
        assert_eq!(config.calculate_max_total_time(), None);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 20],
            sustained_delay: 50,
        };
        assert_eq!(config.calculate_max_total_time(), Some(80));
    }

    #[test]
    fn test_broker_address_defaults() {
        let plain = BrokerAddress::parse("mqtt://broker.local").unwrap();
        assert_eq!((plain.host.as_str(), plain.port, plain.tls), ("broker.local", 1883, false));

        let tls = BrokerAddress::parse("mqtts://broker.local").unwrap();
        assert_eq!((tls.port, tls.tls), (8883, true));

        let explicit = BrokerAddress::parse("tcp://10.0.0.5:2883").unwrap();
        assert_eq!(explicit.port, 2883);
    }

    #[test]
    fn test_invalid_broker_url() {
        assert!(matches!(
            BrokerAddress::parse("invalid-url"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = client_id("laptop");
        let b = client_id("laptop");
        assert!(a.starts_with("bacon-laptop-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("test-node", &BrokerSection::default());
        assert!(options.is_ok());
    }

    #[test]
    fn test_missing_credentials_fail_option_building() {
        let config = BrokerSection {
            username_env: Some("BACON_CONNECTION_TEST_UNSET_USER".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            configure_mqtt_options("n", &config),
            Err(TransportError::Credentials(_))
        ));
    }
}
