//! Subscription registry.
//!
//! Written during the registration phase through [`RegistryBuilder`], then
//! frozen into an immutable [`Registry`] that the delivery loop reads without
//! locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::error::{BrokerError, Result};
use crate::broker::middleware::{compose, Handler, Layer};

/// What to do when a routing key is subscribed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The later handler replaces the earlier one.
    #[default]
    Overwrite,
    /// The second subscription fails.
    Reject,
}

/// Mutable registry used before initialization.
pub struct RegistryBuilder {
    policy: DuplicatePolicy,
    layers: Vec<Layer>,
    handlers: HashMap<String, Handler>,
}

impl RegistryBuilder {
    /// Create a builder; every handler is wrapped with `layers` on insert.
    pub fn new(policy: DuplicatePolicy, layers: &[Layer]) -> Self {
        Self {
            policy,
            layers: layers.to_vec(),
            handlers: HashMap::new(),
        }
    }

    /// Record `handler` under `routing_key`.
    pub fn insert(&mut self, routing_key: &str, handler: Handler) -> Result<()> {
        if self.handlers.contains_key(routing_key) {
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(BrokerError::DuplicateSubscription(routing_key.to_string()))
                }
                DuplicatePolicy::Overwrite => {
                    tracing::warn!(routing_key, "Replacing existing handler for routing key");
                }
            }
        }
        let chained = compose(handler, &self.layers);
        self.handlers.insert(routing_key.to_string(), chained);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Freeze into a read-only registry.
    pub fn freeze(self) -> Registry {
        Registry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Read-only routing key → handler mapping.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: Arc<HashMap<String, Handler>>,
}

impl Registry {
    /// Handler registered for `routing_key`, if any.
    pub fn lookup(&self, routing_key: &str) -> Option<&Handler> {
        self.handlers.get(routing_key)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("routing_keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::event::Event;
    use crate::broker::middleware::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = Arc::clone(counter);
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn overwrite_keeps_latest_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut builder = RegistryBuilder::new(DuplicatePolicy::Overwrite, &[]);
        builder.insert("a.b", counting(&first)).unwrap();
        builder.insert("a.b", counting(&second)).unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.len(), 1);
        let handler = registry.lookup("a.b").unwrap();
        handler(Event::new("q", "a.b", "x")).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reject_refuses_duplicates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut builder = RegistryBuilder::new(DuplicatePolicy::Reject, &[]);
        builder.insert("a.b", counting(&counter)).unwrap();

        let err = builder.insert("a.b", counting(&counter)).unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateSubscription(key) if key == "a.b"));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn lookup_misses_unknown_keys() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut builder = RegistryBuilder::new(DuplicatePolicy::default(), &[]);
        builder.insert("known", counting(&counter)).unwrap();
        let registry = builder.freeze();

        assert!(registry.lookup("known").is_some());
        assert!(registry.lookup("unknown").is_none());
    }
}
