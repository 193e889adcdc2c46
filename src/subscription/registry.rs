//! Thread-safe subscription registry
//!
//! Written by the service API at any time and read by the dispatcher for
//! every inbound message. Cloning the registry shares the same map.

use super::{Subscription, SubscriptionInfo};
use crate::error::SubscriptionError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Map of subscription id to subscription
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Arc<RwLock<BTreeMap<String, Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscription. Duplicate ids and malformed filters are rejected.
    pub fn register(&self, subscription: Subscription) -> Result<(), SubscriptionError> {
        subscription.validate()?;

        let mut subscriptions = self.write();
        if subscriptions.contains_key(&subscription.id) {
            warn!(subscription_id = %subscription.id, "Duplicate subscription id rejected");
            return Err(SubscriptionError::duplicate_id(subscription.id));
        }

        info!(
            subscription_id = %subscription.id,
            topics = ?subscription.topics,
            enabled = subscription.enabled,
            "Registered subscription"
        );
        subscriptions.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            info!(subscription_id = %id, "Unregistered subscription");
        } else {
            debug!(subscription_id = %id, "Unregister of unknown subscription ignored");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Enabled subscriptions with at least one filter matching `topic`
    pub fn get_matching(&self, topic: &str) -> Vec<Subscription> {
        self.read()
            .values()
            .filter(|sub| sub.enabled && sub.matches_topic(topic))
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<SubscriptionInfo> {
        self.read().values().map(Subscription::info).collect()
    }

    pub fn list_enabled(&self) -> Vec<SubscriptionInfo> {
        self.read()
            .values()
            .filter(|sub| sub.enabled)
            .map(Subscription::info)
            .collect()
    }

    pub fn enable(&self, id: &str) -> bool {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.write().get_mut(id) {
            Some(sub) => {
                sub.enabled = enabled;
                debug!(subscription_id = %id, enabled, "Subscription toggled");
                true
            }
            None => false,
        }
    }

    /// Union of filters across enabled subscriptions
    pub fn get_all_topics(&self) -> BTreeSet<String> {
        self.read()
            .values()
            .filter(|sub| sub.enabled)
            .flat_map(|sub| sub.topics.iter().cloned())
            .collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::EventHandler;
    use crate::testing::RecordingHandler;

    fn sub(id: &str, topics: &[&str]) -> Subscription {
        let handler: Arc<dyn EventHandler> = Arc::new(RecordingHandler::new());
        Subscription::new(topics.iter().copied(), handler).with_id(id)
    }

    #[test]
    fn test_register_and_get() {
        let registry = SubscriptionRegistry::new();
        registry.register(sub("s1", &["a/+"])).unwrap();

        assert!(registry.contains("s1"));
        assert_eq!(registry.get("s1").unwrap().topics, vec!["a/+"]);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.register(sub("s1", &["a"])).unwrap();

        let result = registry.register(sub("s1", &["b"]));
        assert!(matches!(result, Err(SubscriptionError::DuplicateId(id)) if id == "s1"));
        assert_eq!(registry.get("s1").unwrap().topics, vec!["a"]);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let registry = SubscriptionRegistry::new();
        let result = registry.register(sub("bad", &["a/b#"]));
        assert!(matches!(result, Err(SubscriptionError::InvalidTopic { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_matching_skips_disabled() {
        let registry = SubscriptionRegistry::new();
        registry.register(sub("meters", &["meters/+"])).unwrap();
        registry.register(sub("all", &["#"])).unwrap();
        registry.register(sub("other", &["alerts/#"])).unwrap();

        let ids = |subs: Vec<Subscription>| subs.into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(registry.get_matching("meters/1")), vec!["all", "meters"]);

        assert!(registry.disable("all"));
        assert_eq!(ids(registry.get_matching("meters/1")), vec!["meters"]);
        assert_eq!(registry.list_enabled().len(), 2);
        assert_eq!(registry.list_all().len(), 3);

        assert!(registry.enable("all"));
        assert_eq!(registry.get_matching("meters/1").len(), 2);
        assert!(!registry.enable("missing"));
    }

    #[test]
    fn test_get_all_topics_is_union_of_enabled() {
        let registry = SubscriptionRegistry::new();
        registry.register(sub("s1", &["a/+", "b/#"])).unwrap();
        registry.register(sub("s2", &["a/+", "c"])).unwrap();
        registry.register(sub("s3", &["d"]).disabled()).unwrap();

        let topics: Vec<String> = registry.get_all_topics().into_iter().collect();
        assert_eq!(topics, vec!["a/+", "b/#", "c"]);
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = SubscriptionRegistry::new();
        registry.register(sub("s1", &["a"])).unwrap();
        registry.register(sub("s2", &["b"])).unwrap();

        assert!(registry.unregister("s1"));
        assert!(!registry.unregister("s1"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = SubscriptionRegistry::new();
        let clone = registry.clone();
        clone.register(sub("s1", &["a"])).unwrap();
        assert!(registry.contains("s1"));
    }

    #[test]
    fn test_concurrent_register_and_match() {
        let registry = SubscriptionRegistry::new();
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .register(sub(&format!("s{i}"), &["meters/#"]))
                        .unwrap();
                    registry.get_matching("meters/1").len()
                })
            })
            .collect();

        for writer in writers {
            assert!(writer.join().unwrap() >= 1);
        }
        assert_eq!(registry.get_matching("meters/1").len(), 8);
    }
}
