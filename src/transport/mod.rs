//! Transport layer
//!
//! [`Broker`] is the seam every outbound transport implements; the MQTT
//! implementation lives in [`mqtt`], test doubles in [`crate::testing`].
//! [`TokenProvider`] is the collaborator that supplies bearer credentials.

use crate::error::TransportError;
use crate::protocol::{BrokerMessage, EventEnvelope, PublishResult, QoS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

pub mod mqtt;
pub mod registry;

pub use registry::BrokerRegistry;

/// Publish-side broker abstraction
///
/// Implementations use interior mutability so a broker can be shared as
/// `Arc<dyn Broker>`. `publish` reports failures in its result and never errors.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open the session; a second call while connected is a no-op
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the session; safe to call when never connected
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(&self, message: BrokerMessage) -> PublishResult;

    fn is_connected(&self) -> bool;

    /// Publish a typed event, deriving the topic from its type when none is given
    async fn publish_event(
        &self,
        event: &EventEnvelope,
        topic: Option<&str>,
        qos: QoS,
        retain: bool,
    ) -> PublishResult {
        let topic = topic
            .map(str::to_string)
            .unwrap_or_else(|| event.derived_topic());

        let message = match BrokerMessage::from_serializable(topic, event) {
            Ok(message) => message,
            Err(e) => return PublishResult::failed(e.to_string()),
        };
        let mut message = message
            .with_qos(qos)
            .with_retain(retain)
            .with_timestamp(event.timestamp);
        if let Some(correlation_id) = &event.correlation_id {
            message = message.with_correlation_id(correlation_id.clone());
        }

        self.publish(message).await
    }
}

/// Error returned by a [`TokenProvider`]
pub type TokenError = Box<dyn std::error::Error + Send + Sync>;

/// Short-lived bearer credential
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens used as MQTT passwords
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken, TokenError>;
}
