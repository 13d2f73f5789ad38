//! Thread-safe double-ended queue between the transport and dispatch.
//!
//! Consumers poll with a bounded timeout so a shutdown flag is observed
//! promptly even while the queue stays empty.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::envelope::BridgeEnvelope;

/// Queue carrying inbound envelopes from the bridge to the dispatch engine.
pub type InboundQueue = BridgeQueue<BridgeEnvelope>;

/// A blocking double-ended queue with timeout polling.
pub struct BridgeQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> BridgeQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Append an item at the tail.
    pub fn push_back(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Insert an item at the head.
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
        self.available.notify_one();
    }

    /// Take the head item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout.
    pub fn poll_first(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Take the head item without waiting.
    pub fn try_poll_first(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Take the tail item without waiting.
    pub fn try_poll_last(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T> Default for BridgeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
