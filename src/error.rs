//! Error types shared across the crate
//!
//! Each layer owns a `thiserror` enum. Handler failures are boxed trait objects
//! so handlers can return whatever error type they already use.

use crate::protocol::topics::TopicError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Error returned by an [`crate::subscription::EventHandler`]
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Registry and subscription misuse. These are programming errors and are never retried.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Subscription '{0}' is already registered")]
    DuplicateId(String),

    #[error("Subscription '{id}' must name at least one topic")]
    NoTopics { id: String },

    #[error("Subscription '{id}' has invalid topic filter '{filter}': {source}")]
    InvalidTopic {
        id: String,
        filter: String,
        #[source]
        source: TopicError,
    },

    #[error("Subscription '{id}' references unknown handler '{handler}'")]
    UnknownHandler { id: String, handler: String },
}

impl SubscriptionError {
    pub fn duplicate_id<S: Into<String>>(id: S) -> Self {
        Self::DuplicateId(id.into())
    }

    pub fn unknown_handler<S: Into<String>, H: Into<String>>(id: S, handler: H) -> Self {
        Self::UnknownHandler {
            id: id.into(),
            handler: handler.into(),
        }
    }
}

/// Error surfaced by any [`crate::transport::Broker`] implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT transport error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Broker '{0}' is not registered")]
    UnknownBroker(String),

    #[error("Broker '{0}' is already registered")]
    DuplicateBroker(String),

    #[error("No brokers configured")]
    NoBrokers,

    #[error("Transport error: {message}")]
    Other { message: String },
}

impl TransportError {
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Top-level error for the binary and embedding applications
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl EventBusError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

impl From<MqttError> for EventBusError {
    fn from(error: MqttError) -> Self {
        Self::Transport(TransportError::Mqtt(error))
    }
}

/// Result type for top-level operations
pub type EventBusResult<T> = Result<T, EventBusError>;
