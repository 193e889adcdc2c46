//! Subscriptions known before the service starts
//!
//! [`SubscriptionDeclarations`] collects subscriptions in code; the service
//! registers them on its first start. [`register_from_config`] turns the
//! `[[subscriptions]]` entries of a config file into registrations, resolving
//! handler names through a [`HandlerCatalog`].

use super::service::EventSubscriptions;
use super::{EventHandler, Subscription};
use crate::config::SubscriptionSpec;
use crate::error::SubscriptionError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata key recording where a subscription came from
pub const SOURCE_KEY: &str = "source";

/// Subscriptions waiting to be registered on service start
#[derive(Default)]
pub struct SubscriptionDeclarations {
    pending: Vec<Subscription>,
}

impl SubscriptionDeclarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `handler` for `topics` under a generated id
    pub fn declare<I, S>(mut self, topics: I, handler: Arc<dyn EventHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Subscription::new(topics, handler));
        self
    }

    pub fn declare_with_id<I, S>(
        mut self,
        id: impl Into<String>,
        topics: I,
        handler: Arc<dyn EventHandler>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Subscription::new(topics, handler).with_id(id));
        self
    }

    /// Queue a subscription, tagging it as declared unless a source is already set
    pub fn push(&mut self, mut subscription: Subscription) {
        subscription
            .metadata
            .entry(SOURCE_KEY)
            .or_insert_with(|| Value::from("declared"));
        self.pending.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn into_vec(self) -> Vec<Subscription> {
        self.pending
    }
}

impl fmt::Debug for SubscriptionDeclarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pending.iter()).finish()
    }
}

/// Named handlers that config entries can refer to
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.insert(name, handler);
        self
    }

    /// Add or replace a handler
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Register the enabled entries of `specs` with `service`.
///
/// Every handler name is resolved before anything is registered, so an
/// unknown name leaves the service untouched. Ids already present are
/// logged and skipped. Returns the ids that were registered.
pub fn register_from_config<S>(
    service: &S,
    specs: &[SubscriptionSpec],
    catalog: &HandlerCatalog,
) -> Result<Vec<String>, SubscriptionError>
where
    S: EventSubscriptions + ?Sized,
{
    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        if !spec.enabled {
            debug!(subscription_id = %spec.id, "Skipping disabled subscription from config");
            continue;
        }
        let handler = catalog
            .get(&spec.handler)
            .ok_or_else(|| SubscriptionError::unknown_handler(&spec.id, &spec.handler))?;
        resolved.push((spec, handler));
    }

    let mut registered = Vec::with_capacity(resolved.len());
    for (spec, handler) in resolved {
        let mut metadata: Map<String, Value> = spec.metadata.clone();
        metadata
            .entry(SOURCE_KEY)
            .or_insert_with(|| Value::from("config"));
        metadata.insert("handler".to_string(), Value::from(spec.handler.clone()));

        let subscription = Subscription::new(spec.topics.clone(), handler)
            .with_id(&spec.id)
            .with_metadata(metadata);

        match service.register(subscription) {
            Ok(id) => registered.push(id),
            Err(SubscriptionError::DuplicateId(id)) => {
                warn!(subscription_id = %id, "Subscription from config already registered, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    info!(count = registered.len(), "Registered subscriptions from config");
    Ok(registered)
}
