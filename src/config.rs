//! Configuration for brokers, the subscription service and declared subscriptions
//!
//! Configuration is TOML. String values may reference the environment with
//! `${VAR}` or `${VAR:-default}`; substitution happens before parsing.
//!
//! ```toml
//! [mqtt]
//! host = "${MQTT_HOST:-localhost}"
//! port = 1883
//! topic_prefix = "site-a"
//!
//! [service]
//! max_concurrent_handlers = 50
//!
//! [[subscriptions]]
//! id = "alerts"
//! topics = ["alerts/#"]
//! handler = "log"
//! ```

use crate::protocol::QoS;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Prefix for auto-generated client identifiers
pub const CLIENT_ID_PREFIX: &str = "eventbus";

/// Broker name reported in contexts of events received over MQTT
pub const DEFAULT_BROKER_NAME: &str = "mqtt_default";

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("environment pattern is a valid regex")
});

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBusConfig {
    /// Broker connectivity; absent means local dispatch only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
}

/// MQTT connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Generated as `eventbus-<8 hex>` when absent
    #[serde(default = "generate_client_id")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// PEM bundle used to verify the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certs: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    /// PEM client key for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Seconds to wait between reconnection attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,
    /// 0 means retry forever
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub topic_prefix: String,
    /// Seconds to wait for the broker's ConnAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds before an enqueued publish is reported as failed
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

/// Shortest keepalive the MQTT client accepts
pub const MIN_KEEPALIVE_SECS: u64 = 5;

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> f64 {
    5.0
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_publish_timeout() -> u64 {
    5
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

/// Generate `eventbus-<8 hex chars>`.
pub fn generate_client_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}-{}", &simple[..8])
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: generate_client_id(),
            username: None,
            password: None,
            use_tls: false,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            keepalive: default_keepalive(),
            clean_session: true,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_attempts: 0,
            topic_prefix: String::new(),
            connect_timeout: default_connect_timeout(),
            publish_timeout: default_publish_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Build a config from `mqtt://host[:port]` or `mqtts://host[:port]`.
    ///
    /// Credentials embedded in the URL are picked up as username/password.
    pub fn from_url(broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        let use_tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

        let mut config = Self::new(host, port);
        config.use_tls = use_tls;
        if !url.username().is_empty() {
            config.username = Some(url.username().to_string());
            config.password = url.password().map(str::to_string);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("mqtt.host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig("mqtt.port must be non-zero".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id cannot be empty".to_string(),
            ));
        }
        if self.keepalive < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keepalive must be at least {MIN_KEEPALIVE_SECS} seconds, got {}",
                self.keepalive
            )));
        }
        if !self.reconnect_interval.is_finite() || self.reconnect_interval < 0.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.reconnect_interval must be a non-negative number of seconds, got {}",
                self.reconnect_interval
            )));
        }
        if self.certfile.is_some() != self.keyfile.is_some() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.certfile and mqtt.keyfile must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured keepalive, raised to [`MIN_KEEPALIVE_SECS`] for unvalidated configs
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive.max(MIN_KEEPALIVE_SECS))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_interval).unwrap_or(Duration::ZERO)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn publish_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.publish_timeout)
    }

    /// Copy of this config with the password replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("***".to_string());
        }
        copy
    }
}

/// `[service]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    #[serde(default = "default_broker_name")]
    pub broker_name: String,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default)]
    pub subscriber_qos: QoS,
}

fn default_broker_name() -> String {
    DEFAULT_BROKER_NAME.to_string()
}

fn default_max_concurrent_handlers() -> usize {
    100
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            broker_name: default_broker_name(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            subscriber_qos: QoS::default(),
        }
    }
}

/// One `[[subscriptions]]` entry; `handler` names an entry in a handler catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSpec {
    pub id: String,
    pub topics: Vec<String>,
    pub handler: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EventBusConfig {
    /// Load, substitute environment references, parse and validate a config file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let resolved = substitute_env_vars(content)?;
        let config: EventBusConfig = toml::from_str(&resolved)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mqtt) = &self.mqtt {
            mqtt.validate()?;
        }
        if self.service.max_concurrent_handlers == 0 {
            return Err(ConfigError::InvalidConfig(
                "service.max_concurrent_handlers must be greater than 0".to_string(),
            ));
        }
        for spec in &self.subscriptions {
            if spec.id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "subscription id cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
host = "localhost"
port = 1883
client_id = "eventbus-test"
topic_prefix = "test"

[service]
max_concurrent_handlers = 4

[[subscriptions]]
id = "alerts"
topics = ["alerts/#"]
handler = "log"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Replace `${VAR}` and `${VAR:-default}` references with environment values.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in ENV_VAR_PATTERN.captures_iter(input) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        output.push_str(&input[last..whole.start()]);

        let value = match std::env::var(name.as_str()) {
            Ok(value) => value,
            Err(_) => match captures.get(2) {
                Some(default) => default.as_str().to_string(),
                None => return Err(ConfigError::EnvVarNotFound(name.as_str().to_string())),
            },
        };
        output.push_str(&value);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
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
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
