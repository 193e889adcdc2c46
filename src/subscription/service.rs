//! Subscription service facade
//!
//! Joins the registry, the dispatcher and (when MQTT is configured) an
//! [`MqttSubscriber`] behind one lifecycle. Without MQTT the service still
//! dispatches locally, which is also what [`NullSubscriptionService`] offers
//! to environments with no messaging infrastructure at all.

use super::declarations::SubscriptionDeclarations;
use super::dispatcher::{EventDispatcher, DEFAULT_MAX_CONCURRENT};
use super::registry::SubscriptionRegistry;
use super::{EventHandler, Subscription, SubscriptionInfo};
use crate::config::{EventBusConfig, MqttConfig, ServiceSection};
use crate::error::{HandlerError, SubscriptionError};
use crate::protocol::{EventContext, EventEnvelope, QoS};
use crate::transport::mqtt::{MessageSink, MqttSubscriber, SubscriberStats};
use crate::transport::TokenProvider;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Broker name recorded on events raised through `dispatch_local`
pub const LOCAL_BROKER_NAME: &str = "local";

/// Aggregated counters across registry, dispatcher and subscriber
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub running: bool,
    pub subscription_count: usize,
    pub enabled_subscriptions: usize,
    pub dispatch_count: u64,
    pub dispatch_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<SubscriberStats>,
}

/// What the rest of a runtime needs from a subscription service
#[async_trait]
pub trait EventSubscriptions: Send + Sync {
    /// Idempotent
    async fn start(&self);

    /// Idempotent
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Register a fully built subscription and return its id
    fn register(&self, subscription: Subscription) -> Result<String, SubscriptionError>;

    /// Register `handler` for `topics` under a generated id
    fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String, SubscriptionError> {
        self.register(Subscription::new(topics, handler))
    }

    /// Remove the registry entry. Network subscriptions are left in place
    /// since other subscriptions may share the same filters.
    fn unsubscribe(&self, id: &str) -> bool;

    fn list_subscriptions(&self) -> Vec<SubscriptionInfo>;

    /// Dispatch without the network; the topic defaults to one derived from the event type
    async fn dispatch_local(&self, event: &EventEnvelope, topic: Option<&str>) -> usize;

    fn stats(&self) -> ServiceStats;
}

/// Feeds subscriber messages into the dispatcher
struct DispatchSink {
    dispatcher: Arc<EventDispatcher>,
    broker_name: String,
}

#[async_trait]
impl MessageSink for DispatchSink {
    async fn on_message(&self, topic: &str, payload: Value, raw: Bytes) -> Result<(), HandlerError> {
        self.dispatcher
            .dispatch_raw(topic, &payload, &self.broker_name, None, Some(raw))
            .await;
        Ok(())
    }
}

pub struct SubscriptionService {
    registry: SubscriptionRegistry,
    dispatcher: Arc<EventDispatcher>,
    mqtt: Option<MqttConfig>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    settings: ServiceSection,
    declarations: StdMutex<Option<SubscriptionDeclarations>>,
    subscriber: RwLock<Option<Arc<MqttSubscriber>>>,
    running: AtomicBool,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl SubscriptionService {
    pub fn builder() -> SubscriptionServiceBuilder {
        SubscriptionServiceBuilder::default()
    }

    /// Local-only service with default settings
    pub fn local() -> Self {
        Self::builder().build()
    }

    /// Service wired from the `[mqtt]` and `[service]` config sections
    pub fn from_config(config: &EventBusConfig) -> Self {
        let mut builder = Self::builder().settings(config.service.clone());
        if let Some(mqtt) = &config.mqtt {
            builder = builder.mqtt(mqtt.clone());
        }
        builder.build()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn broker_name(&self) -> &str {
        &self.settings.broker_name
    }

    /// The live subscriber, present only while running with MQTT configured
    pub fn subscriber(&self) -> Option<Arc<MqttSubscriber>> {
        self.subscriber
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register declared subscriptions once; duplicates are logged and skipped
    fn materialize_declarations(&self) {
        let declarations = self
            .declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(declarations) = declarations else {
            return;
        };

        for subscription in declarations.into_vec() {
            let id = subscription.id.clone();
            match self.registry.register(subscription) {
                Ok(()) => debug!(subscription_id = %id, "Registered declared subscription"),
                Err(e) => warn!(subscription_id = %id, error = %e, "Failed to register declared subscription"),
            }
        }
    }

    async fn start_subscriber(&self, config: &MqttConfig) {
        let topics: Vec<String> = self.registry.get_all_topics().into_iter().collect();
        if topics.is_empty() {
            info!("No topics registered yet, MQTT subscriber will pick up later subscriptions");
        }

        let mut subscriber =
            MqttSubscriber::new(config.clone()).with_qos(self.settings.subscriber_qos);
        if let Some(provider) = &self.token_provider {
            subscriber = subscriber.with_token_provider(Arc::clone(provider));
        }
        let subscriber = Arc::new(subscriber);

        let sink = Arc::new(DispatchSink {
            dispatcher: Arc::clone(&self.dispatcher),
            broker_name: self.settings.broker_name.clone(),
        });
        subscriber.start(topics, sink).await;

        *self
            .subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscriber);
    }
}

#[async_trait]
impl EventSubscriptions for SubscriptionService {
    async fn start(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            warn!("Subscription service already running");
            return;
        }

        self.materialize_declarations();

        if let Some(config) = &self.mqtt {
            self.start_subscriber(config).await;
        } else {
            warn!("No MQTT config provided, external events won't be received");
        }

        self.running.store(true, Ordering::SeqCst);

        // Cover anything registered while the subscriber was starting
        if let Some(subscriber) = self.subscriber() {
            subscriber.add_topics(self.registry.get_all_topics());
        }

        info!(
            subscriptions = self.registry.len(),
            "Subscription service started"
        );
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_running() {
            return;
        }

        let subscriber = self
            .subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscriber) = subscriber {
            subscriber.stop().await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Subscription service stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn register(&self, subscription: Subscription) -> Result<String, SubscriptionError> {
        let id = subscription.id.clone();
        let topics = subscription.enabled.then(|| subscription.topics.clone());
        self.registry.register(subscription)?;

        if let (true, Some(topics)) = (self.is_running(), topics) {
            if let Some(subscriber) = self.subscriber() {
                subscriber.add_topics(topics);
            }
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: &str) -> bool {
        self.registry.unregister(id)
    }

    fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.list_all()
    }

    async fn dispatch_local(&self, event: &EventEnvelope, topic: Option<&str>) -> usize {
        let topic = topic
            .map(str::to_string)
            .unwrap_or_else(|| event.derived_topic());
        let context = EventContext::new(topic, LOCAL_BROKER_NAME);
        self.dispatcher.dispatch(event, &context).await
    }

    fn stats(&self) -> ServiceStats {
        ServiceStats {
            running: self.is_running(),
            subscription_count: self.registry.len(),
            enabled_subscriptions: self.registry.list_enabled().len(),
            dispatch_count: self.dispatcher.dispatch_count(),
            dispatch_errors: self.dispatcher.error_count(),
            mqtt: self.subscriber().map(|subscriber| subscriber.stats()),
        }
    }
}

/// Builder for [`SubscriptionService`]
#[derive(Default)]
pub struct SubscriptionServiceBuilder {
    mqtt: Option<MqttConfig>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    settings: Option<ServiceSection>,
    max_concurrent_handlers: Option<usize>,
    subscriber_qos: Option<QoS>,
    declarations: Option<SubscriptionDeclarations>,
}

impl SubscriptionServiceBuilder {
    pub fn mqtt(mut self, config: MqttConfig) -> Self {
        self.mqtt = Some(config);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn settings(mut self, settings: ServiceSection) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = Some(max);
        self
    }

    pub fn subscriber_qos(mut self, qos: QoS) -> Self {
        self.subscriber_qos = Some(qos);
        self
    }

    /// Subscriptions registered on the first `start`
    pub fn declarations(mut self, declarations: SubscriptionDeclarations) -> Self {
        self.declarations = Some(declarations);
        self
    }

    pub fn build(self) -> SubscriptionService {
        let mut settings = self.settings.unwrap_or_default();
        if let Some(max) = self.max_concurrent_handlers {
            settings.max_concurrent_handlers = max;
        }
        if let Some(qos) = self.subscriber_qos {
            settings.subscriber_qos = qos;
        }

        let registry = SubscriptionRegistry::new();
        let max_concurrent = match settings.max_concurrent_handlers {
            0 => DEFAULT_MAX_CONCURRENT,
            n => n,
        };
        let dispatcher = Arc::new(EventDispatcher::new(registry.clone(), max_concurrent));

        SubscriptionService {
            registry,
            dispatcher,
            mqtt: self.mqtt,
            token_provider: self.token_provider,
            settings,
            declarations: StdMutex::new(self.declarations),
            subscriber: RwLock::new(None),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }
}

/// Service for environments without messaging.
///
/// `start` and `stop` only flip the running flag. Registration and local
/// dispatch behave as in a local-only [`SubscriptionService`].
pub struct NullSubscriptionService {
    inner: SubscriptionService,
    running: AtomicBool,
}

impl NullSubscriptionService {
    pub fn new() -> Self {
        Self {
            inner: SubscriptionService::local(),
            running: AtomicBool::new(false),
        }
    }
}

impl Default for NullSubscriptionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSubscriptions for NullSubscriptionService {
    async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!("Null subscription service started (no-op)");
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!("Null subscription service stopped (no-op)");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn register(&self, subscription: Subscription) -> Result<String, SubscriptionError> {
        self.inner.register(subscription)
    }

    fn unsubscribe(&self, id: &str) -> bool {
        self.inner.unsubscribe(id)
    }

    fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.list_subscriptions()
    }

    async fn dispatch_local(&self, event: &EventEnvelope, topic: Option<&str>) -> usize {
        self.inner.dispatch_local(event, topic).await
    }

    fn stats(&self) -> ServiceStats {
        ServiceStats {
            running: self.is_running(),
            ..self.inner.stats()
        }
    }
}
