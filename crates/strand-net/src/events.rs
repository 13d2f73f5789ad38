//! Connection lifecycle events and their observers.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::envelope::BridgeEnvelope;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCause {
    /// No inbound frame within the heartbeat timeout.
    Timeout,
    /// Closed by the server (I/O failure, replacement, shutdown).
    System,
    /// Closed by the peer.
    User,
}

/// Discriminant of a [`BridgeEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Register,
    Unregister,
    Received,
    ReceivedError,
    ReceivedSuccess,
    Send,
    Discard,
}

/// A lifecycle event emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A new connection was registered.
    Register,
    /// A connection was removed.
    Unregister {
        /// Reason for removal.
        cause: CloseCause,
    },
    /// Raw frame bytes arrived from the transport.
    Received {
        /// The frame bytes.
        bytes: Vec<u8>,
    },
    /// An inbound frame could not be processed.
    ReceivedError {
        /// Human-readable reason.
        reason: String,
    },
    /// An outbound envelope found its destination and is about to be written.
    ReceivedSuccess {
        /// The outbound envelope.
        envelope: BridgeEnvelope,
    },
    /// An outbound envelope was handed to the channel.
    Send {
        /// The outbound envelope.
        envelope: BridgeEnvelope,
    },
    /// The transport disconnected with unread bytes still buffered.
    Discard {
        /// The discarded bytes.
        bytes: Vec<u8>,
    },
}

impl BridgeEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Register => EventKind::Register,
            BridgeEvent::Unregister { .. } => EventKind::Unregister,
            BridgeEvent::Received { .. } => EventKind::Received,
            BridgeEvent::ReceivedError { .. } => EventKind::ReceivedError,
            BridgeEvent::ReceivedSuccess { .. } => EventKind::ReceivedSuccess,
            BridgeEvent::Send { .. } => EventKind::Send,
            BridgeEvent::Discard { .. } => EventKind::Discard,
        }
    }
}

/// Observer of bridge lifecycle events.
pub trait EventListener: Send + Sync {
    /// Whether this listener wants events of `kind` from `connection_id`.
    fn focus(&self, _connection_id: &str, _kind: EventKind) -> bool {
        true
    }

    /// Handle one event.
    fn on_event(&self, connection_id: &str, event: &BridgeEvent);
}

/// Blanket implementation for closures.
impl<F> EventListener for F
where
    F: Fn(&str, &BridgeEvent) + Send + Sync,
{
    fn on_event(&self, connection_id: &str, event: &BridgeEvent) {
        self(connection_id, event);
    }
}

/// Fans events out to every registered listener.
///
/// Registration is expected at startup; publishing takes a snapshot so
/// listeners may register from inside a callback.
#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every interested listener.
    pub fn publish(&self, connection_id: &str, event: BridgeEvent) {
        tracing::trace!(connection_id, kind = ?event.kind(), "Publishing bridge event");
        let listeners = self.listeners.read().clone();
        let kind = event.kind();
        for listener in listeners {
            if listener.focus(connection_id, kind) {
                listener.on_event(connection_id, &event);
            }
        }
    }
}
