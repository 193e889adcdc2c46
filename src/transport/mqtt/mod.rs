//! MQTT transport built on `rumqttc`'s v5 client
//!
//! Pure decisions are kept apart from the I/O tasks that act on them:
//!
//! - [`connection`] - options, TLS and credential resolution
//! - [`message_handler`] - payload encoding and event routing
//! - [`reconnect`] - retry policy, state transitions, token refresh timing
//! - [`publisher`] - [`MqttBroker`], the outbound session
//! - [`subscriber`] - [`MqttSubscriber`], the inbound listener
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_eventbus::config::MqttConfig;
//! use mqtt_eventbus::protocol::BrokerMessage;
//! use mqtt_eventbus::transport::mqtt::MqttBroker;
//! use serde_json::Map;
//!
//! # tokio_test::block_on(async {
//! let broker = MqttBroker::new(MqttConfig::from_url("mqtt://localhost:1883")?);
//! broker.connect().await?;
//!
//! let result = broker.publish(BrokerMessage::new("meters/1", Map::new())).await;
//! assert!(result.success);
//!
//! broker.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod message_handler;
pub mod publisher;
pub mod reconnect;
pub mod subscriber;

pub use connection::{ConnectionState, Credentials, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
pub use publisher::{BrokerStats, MqttBroker};
pub use reconnect::{ConnectionEvent, ReconnectPolicy, ReconnectionDecision};
pub use subscriber::{MessageSink, MqttSubscriber, SubscriberState, SubscriberStats};
