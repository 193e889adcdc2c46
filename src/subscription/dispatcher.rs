//! Event fan-out to matching subscriptions
//!
//! Every matching handler runs in its own task inside a `JoinSet`, gated by
//! one semaphore shared across all dispatches. A handler that errors or
//! panics is logged and counted; siblings and the caller are unaffected.

use super::registry::SubscriptionRegistry;
use crate::error::HandlerError;
use crate::protocol::{EventContext, EventEnvelope};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, Instrument};

/// Default bound on concurrently running handlers
pub const DEFAULT_MAX_CONCURRENT: usize = 100;

pub struct EventDispatcher {
    registry: SubscriptionRegistry,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    dispatch_count: AtomicU64,
    error_count: AtomicU64,
}

impl EventDispatcher {
    /// `max_concurrent` of zero is treated as one
    pub fn new(registry: SubscriptionRegistry, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            dispatch_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Events dispatched so far, matched or not
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    /// Handler invocations that failed or panicked
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.dispatch_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Run every matching handler and wait for all of them.
    ///
    /// Returns the number of handlers invoked.
    pub async fn dispatch(&self, event: &EventEnvelope, context: &EventContext) -> usize {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);

        let matching = self.registry.get_matching(&context.topic);
        if matching.is_empty() {
            debug!(topic = %context.topic, "No subscriptions match topic");
            return 0;
        }

        debug!(
            topic = %context.topic,
            event_type = %event.event_type,
            handlers = matching.len(),
            "Dispatching event"
        );

        let event = Arc::new(event.clone());
        let context = Arc::new(context.clone());
        let mut set: JoinSet<(String, Result<(), HandlerError>)> = JoinSet::new();

        for subscription in matching {
            let semaphore = Arc::clone(&self.semaphore);
            let event = Arc::clone(&event);
            let context = Arc::clone(&context);
            let span = crate::dispatch_span!(
                subscription_id = %subscription.id,
                topic = %context.topic
            );

            set.spawn(
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => subscription.handler.handle(&event, &context).await,
                        Err(_) => Err("dispatcher semaphore closed".into()),
                    };
                    (subscription.id, result)
                }
                .instrument(span),
            );
        }

        let invoked = set.len();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    debug!(subscription_id = %id, topic = %context.topic, "Handler completed");
                }
                Ok((id, Err(e))) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    error!(subscription_id = %id, topic = %context.topic, error = %e, "Handler failed");
                }
                Err(join_error) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    error!(topic = %context.topic, error = %join_error, "Handler panicked");
                }
            }
        }

        invoked
    }

    /// Build the context and envelope for a decoded message, then dispatch
    pub async fn dispatch_raw(
        &self,
        topic: &str,
        payload: &Value,
        broker_name: &str,
        message_id: Option<String>,
        raw_payload: Option<Bytes>,
    ) -> usize {
        let context = EventContext::new(topic, broker_name)
            .with_message_id(message_id)
            .with_raw_payload(raw_payload);
        let event = EventEnvelope::from_json(payload);

        self.dispatch(&event, &context).await
    }
}
