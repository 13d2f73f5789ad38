//! In-process publish/subscribe bus keyed by topic.
//!
//! Messages are encoded once per publish with the bus [`Serializer`] and
//! decoded per listener into the listener's declared message type. Delivery is
//! synchronous and follows registration order; a listener that panics or
//! cannot decode the message does not prevent delivery to the rest.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::serializer::{JsonSerializer, SerializeError, Serializer};

/// A typed bus subscriber.
pub trait Listener: Send + Sync + 'static {
    /// Type each published payload is decoded into.
    type Message: DeserializeOwned;

    /// Handle one message published on `topic`.
    fn on_message(&self, topic: &str, message: Self::Message);
}

/// Identity of a registered listener, derived from its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    /// Key for a shared listener. Clones of the same `Arc` share a key.
    pub fn of<L: ?Sized>(listener: &Arc<L>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

type Deliver = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    key: ListenerKey,
    deliver: Deliver,
}

type Topic = Arc<RwLock<Vec<Subscription>>>;

/// Topic-keyed message router.
pub struct Bus<S: Serializer = JsonSerializer> {
    serializer: Arc<S>,
    topics: DashMap<String, Topic>,
    subscriptions: DashMap<ListenerKey, HashSet<String>>,
}

impl Bus<JsonSerializer> {
    /// Create a bus using JSON payloads.
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl Default for Bus<JsonSerializer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Serializer> Bus<S> {
    /// Create a bus with an explicit serializer.
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            serializer: Arc::new(serializer),
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Subscribe `listener` to `topic`. Registering the same listener twice on
    /// one topic has no effect.
    pub fn register<L: Listener>(&self, topic: &str, listener: Arc<L>) -> ListenerKey {
        let key = ListenerKey::of(&listener);
        let serializer = Arc::clone(&self.serializer);
        let deliver: Deliver = Arc::new(move |topic: &str, payload: &[u8]| {
            match serializer.decode::<L::Message>(payload) {
                Ok(message) => listener.on_message(topic, message),
                Err(e) => tracing::warn!(topic, "Listener could not decode message: {e}"),
            }
        });

        let slot = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone();

        {
            let mut subscribers = slot.write();
            if subscribers.iter().any(|s| s.key == key) {
                return key;
            }
            subscribers.push(Subscription { key, deliver });
        }

        self.subscriptions
            .entry(key)
            .or_default()
            .insert(topic.to_string());
        tracing::debug!(topic, "Listener registered");
        key
    }

    /// Publish `message` to every listener of `topic`.
    ///
    /// Returns the number of listeners that received it.
    pub fn publish<M: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &M,
    ) -> Result<usize, SerializeError> {
        let payload = self.serializer.encode(message)?;
        Ok(self.publish_bytes(topic, &payload))
    }

    /// Publish an already-encoded payload.
    pub fn publish_bytes(&self, topic: &str, payload: &[u8]) -> usize {
        let Some(slot) = self.topics.get(topic).map(|t| Arc::clone(t.value())) else {
            tracing::trace!(topic, "No listeners");
            return 0;
        };
        let subscribers = slot.read().clone();

        let mut delivered = 0;
        for subscription in subscribers {
            let deliver = &subscription.deliver;
            match catch_unwind(AssertUnwindSafe(|| deliver(topic, payload))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(topic, "Listener panicked during delivery"),
            }
        }
        delivered
    }

    /// Remove a listener from every topic.
    pub fn unregister(&self, key: ListenerKey) {
        let Some((_, topics)) = self.subscriptions.remove(&key) else {
            return;
        };
        for topic in topics {
            if let Some(slot) = self.topics.get(&topic).map(|t| Arc::clone(t.value())) {
                slot.write().retain(|s| s.key != key);
            }
        }
    }

    /// Remove a listener from one topic.
    pub fn unregister_from(&self, topic: &str, key: ListenerKey) {
        if let Some(slot) = self.topics.get(topic).map(|t| Arc::clone(t.value())) {
            slot.write().retain(|s| s.key != key);
        }
        self.subscriptions.remove_if_mut(&key, |_, topics| {
            topics.remove(topic);
            topics.is_empty()
        });
    }

    /// Remove every listener from `topic`.
    pub fn clear_topic(&self, topic: &str) {
        let Some((_, slot)) = self.topics.remove(topic) else {
            return;
        };
        let keys: Vec<ListenerKey> = slot.read().iter().map(|s| s.key).collect();
        for key in keys {
            self.subscriptions.remove_if_mut(&key, |_, topics| {
                topics.remove(topic);
                topics.is_empty()
            });
        }
    }

    /// Number of listeners on `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.read().len())
    }

    /// Topics `key` is subscribed to.
    pub fn topics_of(&self, key: ListenerKey) -> Vec<String> {
        self.subscriptions
            .get(&key)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }
}
