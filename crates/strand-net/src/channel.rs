//! The transport capability the bridge writes through.

use std::sync::Arc;

/// Errors reported by a [`Channel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel was closed before the write.
    #[error("channel {0} is closed")]
    Closed(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One logical connection as seen by the bridge.
///
/// Implementations are owned by the transport; the bridge only writes frames,
/// closes, and reads identifying metadata.
pub trait Channel: Send + Sync {
    /// Identifier, unique and stable for the socket's lifetime.
    fn id(&self) -> &str;

    /// Remote host.
    fn remote_host(&self) -> &str;

    /// Remote port.
    fn remote_port(&self) -> u16;

    /// Queue a complete frame for delivery.
    fn write(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Close the channel. Must be idempotent.
    fn close(&self);
}

/// Identifying metadata for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelInfo {
    /// Connection identifier.
    pub id: String,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
}

impl ChannelInfo {
    /// Snapshot the metadata of a channel.
    pub fn of(channel: &dyn Channel) -> Self {
        Self {
            id: channel.id().to_string(),
            host: channel.remote_host().to_string(),
            port: channel.remote_port(),
        }
    }
}

/// Shared handle to a channel.
pub type ChannelRef = Arc<dyn Channel>;

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory channel used across the crate's tests.

    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    pub struct MemoryChannel {
        id: String,
        pub written: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl MemoryChannel {
        pub fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                written: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Channel for MemoryChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn remote_host(&self) -> &str {
            "127.0.0.1"
        }

        fn remote_port(&self) -> u16 {
            40000
        }

        fn write(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
            if self.is_closed() {
                return Err(ChannelError::Closed(self.id.clone()));
            }
            self.written.lock().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
