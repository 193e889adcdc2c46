//! Named broker registry with a default broker
//!
//! Lets a runtime hold several transports (say, an MQTT broker and an
//! in-memory one for local fan-out) and address them by name.

use super::Broker;
use crate::error::TransportError;
use crate::protocol::{BrokerMessage, EventEnvelope, PublishResult, QoS};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info, warn};

#[derive(Default)]
struct Inner {
    brokers: BTreeMap<String, Arc<dyn Broker>>,
    default: Option<String>,
}

/// Thread-safe map of broker name to broker
#[derive(Default)]
pub struct BrokerRegistry {
    inner: RwLock<Inner>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a broker. The first one registered becomes the default.
    pub fn register(&self, name: impl Into<String>, broker: Arc<dyn Broker>) -> Result<(), TransportError> {
        let name = name.into();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.brokers.contains_key(&name) {
            return Err(TransportError::DuplicateBroker(name));
        }
        if inner.default.is_none() {
            inner.default = Some(name.clone());
        }
        info!(broker = %name, "Registered broker");
        inner.brokers.insert(name, broker);
        Ok(())
    }

    /// Register a broker and make it the default
    pub fn register_default(
        &self,
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
    ) -> Result<(), TransportError> {
        let name = name.into();
        self.register(name.clone(), broker)?;
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .default = Some(name);
        Ok(())
    }

    /// Look up a broker by name, or the default when `name` is `None`
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Broker>, TransportError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let name = match name {
            Some(name) => name,
            None => inner.default.as_deref().ok_or(TransportError::NoBrokers)?,
        };
        inner
            .brokers
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownBroker(name.to_string()))
    }

    pub fn default_name(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .brokers
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .brokers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Broker>)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .brokers
            .iter()
            .map(|(name, broker)| (name.clone(), broker.clone()))
            .collect()
    }

    /// Connect every broker; one failure does not stop the others
    pub async fn connect_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for (name, broker) in self.snapshot() {
            match broker.connect().await {
                Ok(()) => {
                    info!(broker = %name, "Connected broker");
                    results.insert(name, true);
                }
                Err(e) => {
                    error!(broker = %name, error = %e, "Failed to connect broker");
                    results.insert(name, false);
                }
            }
        }
        results
    }

    pub async fn disconnect_all(&self) {
        for (name, broker) in self.snapshot() {
            if let Err(e) = broker.disconnect().await {
                warn!(broker = %name, error = %e, "Error disconnecting broker");
            } else {
                info!(broker = %name, "Disconnected broker");
            }
        }
    }

    /// Publish through the named or default broker
    pub async fn publish(&self, message: BrokerMessage, broker_name: Option<&str>) -> PublishResult {
        match self.get(broker_name) {
            Ok(broker) => broker.publish(message).await,
            Err(e) => {
                warn!(error = %e, topic = %message.topic, "Message not published");
                PublishResult::failed(e.to_string())
            }
        }
    }

    pub async fn publish_event(
        &self,
        event: &EventEnvelope,
        topic: Option<&str>,
        broker_name: Option<&str>,
        qos: QoS,
        retain: bool,
    ) -> PublishResult {
        match self.get(broker_name) {
            Ok(broker) => broker.publish_event(event, topic, qos, retain).await,
            Err(e) => {
                warn!(error = %e, event_type = %event.event_type, "Event not published");
                PublishResult::failed(e.to_string())
            }
        }
    }

    /// Publish the same message through every broker
    pub async fn publish_to_all(&self, message: BrokerMessage) -> BTreeMap<String, PublishResult> {
        let mut results = BTreeMap::new();
        for (name, broker) in self.snapshot() {
            let result = broker.publish(message.clone()).await;
            results.insert(name, result);
        }
        results
    }
}
