//! Subscriptions: who wants which events, and how they get them
//!
//! - [`registry`] - the thread-safe id → [`Subscription`] map
//! - [`dispatcher`] - bounded, isolated fan-out of one event to its handlers
//! - [`service`] - lifecycle facade joining the registry, dispatcher and MQTT subscriber
//! - [`declarations`] - subscriptions declared up front or loaded from config

use crate::error::{HandlerError, SubscriptionError};
use crate::protocol::topics::{topic_matches, validate_topic_filter};
use crate::protocol::{EventContext, EventEnvelope};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

pub mod declarations;
pub mod dispatcher;
pub mod registry;
pub mod service;

pub use declarations::{register_from_config, HandlerCatalog, SubscriptionDeclarations};
pub use dispatcher::EventDispatcher;
pub use registry::SubscriptionRegistry;
pub use service::{
    EventSubscriptions, NullSubscriptionService, ServiceStats, SubscriptionService,
    SubscriptionServiceBuilder,
};

/// Something that reacts to events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope, context: &EventContext) -> Result<(), HandlerError>;
}

/// [`EventHandler`] backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope, EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &EventEnvelope, context: &EventContext) -> Result<(), HandlerError> {
        (self.f)(event.clone(), context.clone()).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```rust
/// use mqtt_eventbus::subscription::handler_fn;
///
/// let handler = handler_fn(|event, _ctx| async move {
///     println!("got {}", event.event_type);
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventEnvelope, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// A handler bound to a set of topic filters
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub topics: Vec<String>,
    pub handler: Arc<dyn EventHandler>,
    pub enabled: bool,
    pub metadata: Map<String, Value>,
}

impl Subscription {
    /// Enabled subscription with a generated `sub-xxxxxxxx` id
    pub fn new<I, S>(topics: I, handler: Arc<dyn EventHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: generate_subscription_id(),
            topics: topics.into_iter().map(Into::into).collect(),
            handler,
            enabled: true,
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when any of the filters matches `topic`
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topics.iter().any(|pattern| topic_matches(topic, pattern))
    }

    pub fn validate(&self) -> Result<(), SubscriptionError> {
        if self.topics.is_empty() {
            return Err(SubscriptionError::NoTopics {
                id: self.id.clone(),
            });
        }
        for filter in &self.topics {
            validate_topic_filter(filter).map_err(|source| SubscriptionError::InvalidTopic {
                id: self.id.clone(),
                filter: filter.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            topics: self.topics.clone(),
            enabled: self.enabled,
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("enabled", &self.enabled)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Handler-free view of a subscription for listings and stats
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub topics: Vec<String>,
    pub enabled: bool,
    pub metadata: Map<String, Value>,
}

fn generate_subscription_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("sub-{}", &uuid[..8])
}
