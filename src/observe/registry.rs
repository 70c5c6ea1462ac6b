//! Subscription registry: application interest mapped onto the index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use super::attribute_index::AttributeIndex;
use super::listener::Listener;
use crate::events::{EventPattern, PatternKey};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Pattern has no set attribute and would never match")]
    EmptyPattern,
}

#[derive(Default)]
struct Inner {
    index: AttributeIndex,
    listeners: HashMap<PatternKey, Vec<Listener>>,
}

/// Pattern → listeners registry backed by an [`AttributeIndex`].
///
/// One listener entry is kept per `subscribe` call and one index reference
/// goes with it, so the index's reference count always equals the number of
/// listener entries under a key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for events matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: Arc<dyn EventPattern>,
        listener: Listener,
    ) -> Result<PatternKey, RegistryError> {
        if pattern.attribute_count() == 0 {
            return Err(RegistryError::EmptyPattern);
        }

        let mut inner = self.inner.write();
        let key = inner.index.insert(pattern);
        debug!("Subscribed {:?} under pattern {}", listener, key);
        inner.listeners.entry(key).or_default().push(listener);
        Ok(key)
    }

    /// Removes one registration of `listener` under `pattern`. Returns `false`
    /// and leaves the index untouched when there was none.
    pub fn unsubscribe(&self, pattern: &dyn EventPattern, listener: &Listener) -> bool {
        let key = PatternKey::of(pattern);
        let mut inner = self.inner.write();

        let Some(listeners) = inner.listeners.get_mut(&key) else {
            warn!("Unsubscribe for unknown pattern {}", key);
            return false;
        };

        let Some(position) = listeners.iter().position(|l| l == listener) else {
            warn!("Listener {:?} is not subscribed to pattern {}", listener, key);
            return false;
        };

        listeners.remove(position);
        if listeners.is_empty() {
            inner.listeners.remove(&key);
        }
        inner.index.remove(pattern);
        debug!("Unsubscribed {:?} from pattern {}", listener, key);
        true
    }

    /// Every `(pattern, listener)` pair that should see `event`.
    pub fn resolve(&self, event: &dyn EventPattern) -> Vec<(Arc<dyn EventPattern>, Listener)> {
        let inner = self.inner.read();

        inner
            .index
            .search(event)
            .into_iter()
            .flat_map(|found| {
                inner
                    .listeners
                    .get(&found.key)
                    .into_iter()
                    .flatten()
                    .map(move |listener| (Arc::clone(&found.pattern), listener.clone()))
            })
            .collect()
    }

    /// Number of distinct patterns with at least one listener.
    pub fn pattern_count(&self) -> usize {
        self.inner.read().index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use serde_json::json;

    fn pattern(value: serde_json::Value) -> Arc<dyn EventPattern> {
        Arc::new(Event::from_value(value).unwrap())
    }

    fn event(value: serde_json::Value) -> Event {
        Event::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_expands_all_listeners() {
        let registry = SubscriptionRegistry::new();
        let quotes = pattern(json!({"symbol": "AAPL"}));
        registry.subscribe(Arc::clone(&quotes), Listener::channel("a")).unwrap();
        registry.subscribe(Arc::clone(&quotes), Listener::channel("b")).unwrap();
        registry
            .subscribe(pattern(json!({"symbol": "AAPL", "side": "buy"})), Listener::channel("c"))
            .unwrap();

        let resolved = registry.resolve(&event(json!({"symbol": "AAPL", "side": "buy"})));
        let mut names: Vec<_> = resolved.iter().map(|(_, l)| format!("{:?}", l)).collect();
        names.sort();
        assert_eq!(names, vec!["Channel(a)", "Channel(b)", "Channel(c)"]);
    }

    #[test]
    fn test_same_listener_under_several_patterns() {
        let registry = SubscriptionRegistry::new();
        let listener = Listener::channel("all");
        registry.subscribe(pattern(json!({"symbol": "AAPL"})), listener.clone()).unwrap();
        registry.subscribe(pattern(json!({"symbol": "MSFT"})), listener.clone()).unwrap();

        assert_eq!(registry.resolve(&event(json!({"symbol": "AAPL"}))).len(), 1);
        assert_eq!(registry.resolve(&event(json!({"symbol": "MSFT"}))).len(), 1);
        assert_eq!(registry.pattern_count(), 2);
    }

    #[test]
    fn test_unsubscribe_unknown_listener_keeps_index() {
        let registry = SubscriptionRegistry::new();
        let p = pattern(json!({"symbol": "AAPL"}));
        registry.subscribe(Arc::clone(&p), Listener::channel("a")).unwrap();

        assert!(!registry.unsubscribe(p.as_ref(), &Listener::channel("zzz")));
        assert_eq!(registry.resolve(&event(json!({"symbol": "AAPL"}))).len(), 1);

        assert!(registry.unsubscribe(p.as_ref(), &Listener::channel("a")));
        assert!(registry.resolve(&event(json!({"symbol": "AAPL"}))).is_empty());
        assert_eq!(registry.pattern_count(), 0);
    }

    #[test]
    fn test_double_subscribe_needs_double_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        let p = pattern(json!({"symbol": "AAPL"}));
        let listener = Listener::channel("a");
        registry.subscribe(Arc::clone(&p), listener.clone()).unwrap();
        registry.subscribe(Arc::clone(&p), listener.clone()).unwrap();

        assert!(registry.unsubscribe(p.as_ref(), &listener));
        assert_eq!(registry.resolve(&event(json!({"symbol": "AAPL"}))).len(), 1);

        assert!(registry.unsubscribe(p.as_ref(), &listener));
        assert!(registry.resolve(&event(json!({"symbol": "AAPL"}))).is_empty());
    }

    #[test]
    fn test_empty_pattern_is_rejected() {
        let registry = SubscriptionRegistry::new();
        let result = registry.subscribe(pattern(json!({"symbol": null})), Listener::channel("a"));
        assert!(matches!(result, Err(RegistryError::EmptyPattern)));
    }
}
