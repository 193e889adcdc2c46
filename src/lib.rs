//! MQTT event bus
//!
//! A publish/subscribe layer over MQTT v5 for typed JSON events.
//!
//! # Overview
//!
//! This crate provides:
//! - Event envelopes and broker messages ([`protocol`])
//! - MQTT wildcard matching and filter validation ([`protocol::topics`])
//! - An MQTT publisher and a reconnecting, token-refreshing subscriber ([`transport::mqtt`])
//! - A subscription registry with bounded, isolated handler dispatch ([`subscription`])
//! - Structured logging setup ([`observability`])
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_eventbus::protocol::EventEnvelope;
//! use mqtt_eventbus::subscription::{handler_fn, EventSubscriptions, SubscriptionService};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let service = SubscriptionService::local();
//! service
//!     .subscribe(
//!         vec!["meter/+".to_string()],
//!         handler_fn(|event, ctx| async move {
//!             println!("{} on {}", event.event_type, ctx.topic);
//!             Ok(())
//!         }),
//!     )
//!     .unwrap();
//!
//! let event = EventEnvelope::new("meter.reading", json!({"kwh": 4.2}));
//! assert_eq!(service.dispatch_local(&event, None).await, 1);
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, EventBusConfig, MqttConfig, ServiceSection, SubscriptionSpec};
pub use error::{EventBusError, EventBusResult, HandlerError, SubscriptionError, TransportError};
pub use protocol::{BrokerMessage, EventContext, EventEnvelope, EventSource, PublishResult, QoS};
pub use subscription::{
    handler_fn, EventHandler, EventSubscriptions, NullSubscriptionService, Subscription,
    SubscriptionService,
};
pub use transport::mqtt::{MqttBroker, MqttSubscriber};
pub use transport::{Broker, BrokerRegistry, TokenProvider};
