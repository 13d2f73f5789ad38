//! Per-connection key/value state.
//!
//! Sessions are created on first access and live until removed or until the
//! dispatch engine shuts down. They are independent of connection liveness:
//! the heartbeat sweeper never touches them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

type Attributes = HashMap<String, Box<dyn Any + Send + Sync>>;

struct SessionInner {
    id: String,
    attributes: RwLock<Attributes>,
}

/// Shared handle to one connection's session. Clones refer to the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.to_string(),
                attributes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Connection id this session belongs to.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Store an attribute, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner
            .attributes
            .write()
            .insert(key.into(), Box::new(value));
    }

    /// Fetch a copy of an attribute. Returns `None` if absent or of another type.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .attributes
            .read()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove an attribute. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.attributes.write().remove(key).is_some()
    }

    /// Whether an attribute is set.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.attributes.read().contains_key(key)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.inner.attributes.read().len()
    }

    /// Whether no attribute is set.
    pub fn is_empty(&self) -> bool {
        self.inner.attributes.read().is_empty()
    }

    /// Whether two handles refer to the same session.
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("attributes", &self.len())
            .finish()
    }
}

/// Lazily populated map of sessions keyed by connection id.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `connection_id`, creating it on first access.
    ///
    /// Concurrent first accesses for the same id yield the same session.
    pub fn get(&self, connection_id: &str) -> Session {
        self.sessions
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(connection_id, "Session created");
                Session::new(connection_id)
            })
            .clone()
    }

    /// Return the session if it already exists.
    pub fn find(&self, connection_id: &str) -> Option<Session> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    /// Delete a session.
    pub fn remove(&self, connection_id: &str) -> Option<Session> {
        self.sessions.remove(connection_id).map(|(_, s)| s)
    }

    /// Delete every session.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session exists.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_concurrent_first_access_yields_same_session() {
        let store = Arc::new(SessionStore::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.get("conn-1")
                })
            })
            .collect();

        let sessions: Vec<Session> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for s in &sessions[1..] {
            assert!(s.same(&sessions[0]));
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_after_remove_creates_new_instance() {
        let store = SessionStore::new();
        let first = store.get("c");
        first.set("user", "joe".to_string());

        store.remove("c");
        let second = store.get("c");

        assert!(!first.same(&second));
        assert_eq!(second.get::<String>("user"), None);
    }

    #[test]
    fn test_attributes_are_typed() {
        let session = SessionStore::new().get("c");
        session.set("count", 3u32);
        assert_eq!(session.get::<u32>("count"), Some(3));
        assert_eq!(session.get::<String>("count"), None);
        assert!(session.remove("count"));
        assert!(!session.contains("count"));
    }

    #[test]
    fn test_find_does_not_create() {
        let store = SessionStore::new();
        assert!(store.find("missing").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let store = SessionStore::new();
        let a = store.get("c");
        let b = store.get("c");
        a.set("k", 1i64);
        assert_eq!(b.get::<i64>("k"), Some(1));
    }
}
