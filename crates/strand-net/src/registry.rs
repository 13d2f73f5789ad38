//! Live connection tracking and heartbeat-based eviction.
//!
//! The [`ConnectionRegistry`] maps connection ids to [`Connection`]s and is
//! safe to share across threads without external locking. A
//! [`HeartbeatSweeper`] thread periodically removes connections that have
//! been silent for longer than the heartbeat timeout.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use crate::channel::{ChannelInfo, ChannelRef};

/// Lower bound for the heartbeat timeout.
pub const MIN_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sweep period for a given timeout: one fifth of it.
pub fn sweep_period(heartbeat_timeout: Duration) -> Duration {
    (heartbeat_timeout / 5).max(Duration::from_millis(1))
}

/// A registered connection.
pub struct Connection {
    channel: ChannelRef,
    info: ChannelInfo,
    last_active: Mutex<Instant>,
}

impl Connection {
    fn new(channel: ChannelRef) -> Self {
        let info = ChannelInfo::of(channel.as_ref());
        Self {
            channel,
            info,
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Identifying metadata.
    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// The underlying channel.
    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// When the last inbound frame arrived.
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Time since the last inbound frame, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, at: Instant) {
        *self.last_active.lock() = at;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("last_active", &self.last_active())
            .finish()
    }
}

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// A new connection was inserted.
    Inserted,
    /// The same channel was registered again; nothing changed.
    Duplicate,
    /// A different channel held the id and was replaced. The caller is
    /// responsible for closing it.
    Replaced(Arc<Connection>),
}

/// Concurrent map of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    heartbeat_timeout: Duration,
}

impl ConnectionRegistry {
    /// Create a registry that treats connections idle for longer than
    /// `heartbeat_timeout` as expired.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            heartbeat_timeout,
        }
    }

    /// The configured heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a channel under its id. Last writer wins on id collisions.
    pub fn register(&self, channel: ChannelRef) -> Registration {
        let id = channel.id().to_string();
        match self.connections.entry(id) {
            Entry::Occupied(mut existing) => {
                if Arc::ptr_eq(existing.get().channel(), &channel) {
                    Registration::Duplicate
                } else {
                    let old = existing.insert(Arc::new(Connection::new(channel)));
                    Registration::Replaced(old)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Connection::new(channel)));
                Registration::Inserted
            }
        }
    }

    /// Look up a connection.
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Reset a connection's activity timestamp. Returns `false` if unknown.
    pub fn touch(&self, id: &str) -> bool {
        match self.connections.get(id) {
            Some(connection) => {
                connection.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a connection without closing it.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, c)| c)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Drop every connection.
    pub fn clear(&self) {
        self.connections.clear();
    }

    /// Remove and close every connection idle for longer than the timeout at
    /// `now`, returning the evicted connections.
    pub fn sweep(&self, now: Instant) -> Vec<Arc<Connection>> {
        let expired: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.idle_for(now) > self.heartbeat_timeout)
            .map(|c| c.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            // Re-check under the shard lock: a frame may have arrived since.
            let removed = self
                .connections
                .remove_if(&id, |_, c| c.idle_for(now) > self.heartbeat_timeout);
            if let Some((_, connection)) = removed {
                tracing::debug!(connection_id = %id, "Heartbeat timeout");
                connection.channel().close();
                evicted.push(connection);
            }
        }
        evicted
    }
}

/// Background thread that sweeps a registry on a fixed period.
pub struct HeartbeatSweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatSweeper {
    /// Spawn a sweeper running every `period`. `on_evict` is called for each
    /// connection removed by a sweep.
    pub fn spawn<F>(
        registry: Arc<ConnectionRegistry>,
        period: Duration,
        on_evict: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(Arc<Connection>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("heartbeat-sweeper".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            for connection in registry.sweep(Instant::now()) {
                                on_evict(connection);
                            }
                        }
                        // Stop requested or the sweeper handle was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Heartbeat sweeper stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the sweeper and wait for its thread to exit.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Heartbeat sweeper thread panicked");
        }
    }
}

impl Drop for HeartbeatSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
