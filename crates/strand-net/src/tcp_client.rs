//! Client side of the protocol with a single automatic reconnect.
//!
//! A connected session runs three tasks: a reader feeding the frame
//! reassembler, a writer draining the send queue and a heartbeat task that
//! queues an empty frame whenever the connection has been quiet for a full
//! heartbeat period. State changes are broadcast through a [`watch`] channel.
//!
//! Any I/O failure on the read or write path makes the client try exactly one
//! reconnect. If that attempt fails the client parks in
//! [`ConnectionState::Failed`] until [`Client::start`] is called again.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::datagram::{self, DEFAULT_VERSION, DatagramType, FrameError};
use crate::envelope::InterfaceData;
use crate::reassembler::{FrameReassembler, ReassemblerConfig, read_frames};
use crate::serializer::{JsonSerializer, SerializeError, Serializer};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped by the caller.
    Disconnected,
    /// Initial connection in progress.
    Connecting,
    /// Connected and exchanging frames.
    Connected,
    /// Connection lost; the single reconnect attempt is running.
    Reconnecting,
    /// The reconnect attempt failed. Terminal until the next `start`.
    Failed,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Notifications delivered to a [`ClientListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection was established.
    Register,
    /// An application envelope arrived.
    Receive(InterfaceData),
    /// The connection failed.
    Failed,
    /// A reconnect attempt is starting.
    Reconnect,
    /// The client stopped, by request or after the reconnect failed.
    Unregister,
}

/// Observer of client events.
pub trait ClientListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: ClientEvent);
}

impl<F> ClientListener for F
where
    F: Fn(ClientEvent) + Send + Sync,
{
    fn on_event(&self, event: ClientEvent) {
        self(event);
    }
}

/// Errors returned by [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client is not connected.
    #[error("client is not connected")]
    NotConnected,

    /// The client was stopped while connecting.
    #[error("client was stopped")]
    Stopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be built.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The envelope could not be encoded.
    #[error("serialize error: {0}")]
    Serialize(#[from] SerializeError),
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address.
    pub addr: SocketAddr,
    /// Quiet time after which a heartbeat frame is sent.
    pub heartbeat_period: Duration,
    /// Version byte for outgoing frames.
    pub version: u8,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Reassembly settings for inbound frames.
    pub reassembler: ReassemblerConfig,
}

impl ClientOptions {
    /// Options for `addr` with default settings.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            heartbeat_period: Duration::from_secs(10),
            version: DEFAULT_VERSION,
            nodelay: true,
            reassembler: ReassemblerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Send queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Outgoing {
    frame: Vec<u8>,
    heartbeat: bool,
}

/// Frames waiting for the writer task.
#[derive(Default)]
struct SendQueue {
    items: Mutex<VecDeque<Outgoing>>,
    ready: Notify,
}

impl SendQueue {
    fn push_back(&self, item: Outgoing) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    fn push_front(&self, item: Outgoing) {
        self.items.lock().push_front(item);
        self.ready.notify_one();
    }

    async fn next(&self) -> Outgoing {
        loop {
            let item = self.items.lock().pop_front();
            if let Some(item) = item {
                return item;
            }
            self.ready.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Session {
    stop_tx: watch::Sender<bool>,
}

impl Session {
    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

struct Inner<S> {
    options: ClientOptions,
    serializer: S,
    state: ConnectionStateWatch,
    listener: Option<Arc<dyn ClientListener>>,
    queue: SendQueue,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    connect_attempts: AtomicU64,
    heartbeats_sent: AtomicU64,
    last_activity: Mutex<Instant>,
}

/// Protocol client with automatic single reconnect.
pub struct Client<S: Serializer = JsonSerializer> {
    inner: Arc<Inner<S>>,
}

impl Client<JsonSerializer> {
    /// Create a client using JSON envelopes.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_serializer(options, JsonSerializer)
    }
}

impl<S: Serializer> Client<S> {
    /// Create a client with an explicit serializer.
    pub fn with_serializer(options: ClientOptions, serializer: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                serializer,
                state: ConnectionStateWatch::new(),
                listener: None,
                queue: SendQueue::default(),
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                heartbeats_sent: AtomicU64::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Attach an event listener. Must be called before [`Client::start`].
    pub fn with_listener(mut self, listener: Arc<dyn ClientListener>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.listener = Some(listener);
        } else {
            tracing::warn!("Client listener attached after start, ignoring");
        }
        self
    }

    /// Connect, replacing any existing session.
    pub async fn start(&self) -> Result<(), ClientError> {
        let generation = {
            let mut session = self.inner.session.lock();
            if let Some(old) = session.take() {
                old.stop();
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.inner.state.set(ConnectionState::Connecting);

        match Arc::clone(&self.inner).establish(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.inner.is_current(generation) {
                    tracing::warn!("Connect to {} failed: {e}", self.inner.options.addr);
                    self.inner.state.set(ConnectionState::Failed);
                    self.inner.emit(ClientEvent::Failed);
                }
                Err(e)
            }
        }
    }

    /// Stop the session and its background tasks.
    pub fn stop(&self) {
        let stopped = {
            let mut session = self.inner.session.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            session.take()
        };
        if let Some(session) = stopped {
            session.stop();
            self.inner.emit(ClientEvent::Unregister);
        }
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Queue an application envelope for sending.
    pub fn write(&self, data: &InterfaceData) -> Result<(), ClientError> {
        let body = self.inner.serializer.encode(data)?;
        let frame = datagram::encode(&body, self.inner.options.version, DatagramType::Application)?;
        self.write_frame(frame.into_frame())
    }

    /// Queue a complete frame for sending.
    pub fn write_frame(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        match self.inner.state.current() {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                Err(ClientError::NotConnected)
            }
            _ => {
                self.inner.queue.push_back(Outgoing {
                    frame,
                    heartbeat: false,
                });
                Ok(())
            }
        }
    }

    /// The connection state watch.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.inner.state
    }

    /// Total connection attempts, reconnects included.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Heartbeat frames written to the socket.
    pub fn heartbeats_sent(&self) -> u64 {
        self.inner.heartbeats_sent.load(Ordering::SeqCst)
    }

    /// Frames waiting to be written.
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.len()
    }
}

impl<S> Drop for Client<S>
where
    S: Serializer,
{
    fn drop(&mut self) {
        if let Some(session) = self.inner.session.lock().take() {
            session.stop();
        }
    }
}

impl<S: Serializer> Inner<S> {
    fn emit(&self, event: ClientEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(event);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<(), ClientError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(self.options.addr).await?;
        if self.options.nodelay {
            stream.set_nodelay(true)?;
        }
        let (reader, writer) = stream.into_split();
        let (stop_tx, stop_rx) = watch::channel(false);

        {
            let mut session = self.session.lock();
            if !self.is_current(generation) {
                return Err(ClientError::Stopped);
            }
            if let Some(old) = session.replace(Session { stop_tx }) {
                old.stop();
            }
        }

        self.touch();
        self.state.set(ConnectionState::Connected);
        tracing::info!("Connected to {}", self.options.addr);

        tokio::spawn(Arc::clone(&self).read_loop(reader, generation, stop_rx.clone()));
        tokio::spawn(Arc::clone(&self).write_loop(writer, generation, stop_rx.clone()));
        tokio::spawn(Arc::clone(&self).heartbeat_loop(stop_rx));

        self.emit(ClientEvent::Register);
        Ok(())
    }

    /// React to an I/O failure seen by a task of session `generation`.
    ///
    /// Only the first report per session is acted upon. Boxed because the
    /// session tasks spawned by `establish` call back into it.
    fn fail(self: Arc<Self>, generation: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.recover(generation).await })
    }

    async fn recover(self: Arc<Self>, generation: u64) {
        let next = generation + 1;
        {
            let mut session = self.session.lock();
            if self
                .generation
                .compare_exchange(generation, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            if let Some(old) = session.take() {
                old.stop();
            }
        }

        tracing::warn!("Connection to {} lost, reconnecting once", self.options.addr);
        self.state.set(ConnectionState::Reconnecting);
        self.emit(ClientEvent::Failed);
        self.emit(ClientEvent::Reconnect);

        if let Err(e) = Arc::clone(&self).establish(next).await
            && self.is_current(next)
        {
            tracing::error!("Reconnect to {} failed: {e}", self.options.addr);
            self.state.set(ConnectionState::Failed);
            self.emit(ClientEvent::Unregister);
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        generation: u64,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut reassembler = FrameReassembler::new(&self.options.reassembler);
        loop {
            tokio::select! {
                result = read_frames(&mut reader, &mut reassembler) => {
                    match result {
                        Ok(frames) => {
                            self.touch();
                            for frame in frames {
                                self.deliver(frame);
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Read failed: {e}");
                            tokio::spawn(Arc::clone(&self).fail(generation));
                            break;
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }

    fn deliver(&self, frame: datagram::Datagram) {
        if frame.kind() != DatagramType::Application {
            return;
        }
        match self.serializer.decode::<InterfaceData>(frame.body()) {
            Ok(data) => self.emit(ClientEvent::Receive(data)),
            Err(e) => tracing::warn!("Undecodable envelope: {e}"),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        generation: u64,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                item = self.queue.next() => {
                    if let Err(e) = writer.write_all(&item.frame).await {
                        tracing::debug!("Write failed: {e}");
                        if !item.heartbeat {
                            self.queue.push_front(item);
                        }
                        tokio::spawn(Arc::clone(&self).fail(generation));
                        break;
                    }
                    self.touch();
                    if item.heartbeat {
                        self.heartbeats_sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
                _ = stop.changed() => break,
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn heartbeat_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self.options.heartbeat_period;
        let beat = datagram::heartbeat(self.options.version).into_frame();
        loop {
            let due = *self.last_activity.lock() + period;
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {
                    if self.last_activity.lock().elapsed() >= period {
                        self.touch();
                        self.queue.push_back(Outgoing {
                            frame: beat.clone(),
                            heartbeat: true,
                        });
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}
