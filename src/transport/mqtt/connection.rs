//! Pure connection configuration for MQTT sessions
//!
//! This module turns an [`MqttConfig`] plus resolved credentials into
//! `rumqttc` options, including TLS, and defines the connection state and
//! error types shared by the publisher and the subscriber.

use crate::config::MqttConfig;
use crate::transport::TokenProvider;
use chrono::{DateTime, Utc};
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Username sent when authenticating with a bearer token
pub const TOKEN_USERNAME: &str = "jwt";

/// Connection state for an MQTT session
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
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Failed to load TLS material from {}", path.display())]
    Tls {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Token provider failed")]
    Auth(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Username and password for one connection attempt
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Set when the password is a bearer token
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Resolve credentials for a new connection.
///
/// A token provider takes precedence over static credentials and yields
/// `username = "jwt"`, `password = <access token>`.
pub async fn resolve_credentials(
    config: &MqttConfig,
    token_provider: Option<&dyn TokenProvider>,
) -> Result<Option<Credentials>, MqttError> {
    if let Some(provider) = token_provider {
        let token = provider.get_token().await.map_err(MqttError::Auth)?;
        return Ok(Some(Credentials {
            username: TOKEN_USERNAME.to_string(),
            password: token.access_token,
            expires_at: Some(token.expires_at),
        }));
    }

    Ok(config.username.as_ref().map(|username| Credentials {
        username: username.clone(),
        password: config.password.clone().unwrap_or_default(),
        expires_at: None,
    }))
}

/// Build `rumqttc` options for one session
pub fn configure_mqtt_options(
    config: &MqttConfig,
    client_id: &str,
    credentials: Option<&Credentials>,
) -> Result<MqttOptions, MqttError> {
    let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);

    mqtt_options.set_keep_alive(config.keepalive_duration());
    mqtt_options.set_clean_start(config.clean_session);
    mqtt_options.set_max_packet_size(Some(config.max_packet_size));

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    if config.use_tls {
        mqtt_options.set_transport(build_tls_transport(config)?);
    }

    Ok(mqtt_options)
}

/// TLS transport from the configured PEM files, or the platform roots when no CA is given
pub fn build_tls_transport(config: &MqttConfig) -> Result<RumqttcTransport, MqttError> {
    let Some(ca_path) = &config.ca_certs else {
        if config.certfile.is_some() {
            warn!("Client certificate configured without ca_certs; using default TLS roots without client auth");
        }
        return Ok(RumqttcTransport::tls_with_default_config());
    };

    let ca = read_pem(ca_path)?;
    let client_auth = match (&config.certfile, &config.keyfile) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(RumqttcTransport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::Tls {
        path: path.to_path_buf(),
        source,
    })
}
