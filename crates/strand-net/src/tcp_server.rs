//! TCP transport feeding a [`Bridge`].
//!
//! Each accepted socket is wrapped in a [`TcpChannel`] and registered with the
//! bridge. A per-connection task runs the frame reassembler and hands every
//! complete frame to [`Bridge::receive`]; a writer task drains frames queued
//! through [`Channel::write`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::bridge::Bridge;
use crate::channel::{Channel, ChannelError};
use crate::datagram::FrameError;
use crate::events::CloseCause;
use crate::reassembler::{FrameReassembler, ReassemblerConfig, read_frames};
use crate::serializer::{JsonSerializer, Serializer};

/// Atomic generator for connection ids of the form `conn-N`.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique id.
    pub fn next_id(&self) -> String {
        format!("conn-{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    /// Per-connection reassembly settings.
    pub reassembler: ReassemblerConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10051)),
            max_connections: 1024,
            nodelay: true,
            reassembler: ReassemblerConfig::default(),
        }
    }
}

/// A [`Channel`] backed by a tokio writer task.
pub struct TcpChannel {
    id: String,
    host: String,
    port: u16,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl TcpChannel {
    fn new(id: String, peer: SocketAddr, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            host: peer.ip().to_string(),
            port: peer.port(),
            outbound,
            closed,
        }
    }

    /// Whether [`Channel::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_host(&self) -> &str {
        &self.host
    }

    fn remote_port(&self) -> u16 {
        self.port
    }

    fn write(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Accepts sockets and drives per-connection reassembly.
pub struct TcpTransport<S: Serializer = JsonSerializer> {
    config: TransportConfig,
    bridge: Arc<Bridge<S>>,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: Serializer> TcpTransport<S> {
    /// Create a transport feeding `bridge`.
    pub fn new(config: TransportConfig, bridge: Arc<Bridge<S>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            bridge,
            id_gen: IdGenerator::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Transport listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    self.accept(stream, peer);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Transport shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop and every connection task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if self.bridge.registry().len() >= self.config.max_connections {
            tracing::warn!("Connection limit reached, rejecting {peer}");
            return;
        }
        if self.config.nodelay
            && let Err(e) = stream.set_nodelay(true)
        {
            tracing::warn!("Failed to set TCP_NODELAY for {peer}: {e}");
        }

        let id = self.id_gen.next_id();
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(TcpChannel::new(id.clone(), peer, outbound_tx));

        if let Err(e) = self.bridge.register(channel.clone()) {
            tracing::warn!(connection_id = %id, "Rejecting {peer}: {e}");
            return;
        }
        tracing::info!(connection_id = %id, "Accepted connection from {peer}");

        tokio::spawn(write_loop(writer, outbound_rx, channel.close_signal()));

        let bridge = Arc::clone(&self.bridge);
        let reassembler = FrameReassembler::new(&self.config.reassembler);
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            read_loop(&bridge, &channel, reader, reassembler, shutdown_rx).await;
            tracing::info!(connection_id = %channel.id(), "Connection finished");
        });
    }
}

/// Drain queued frames onto the socket until the channel closes.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::warn!("Socket write failed: {e}");
                    break;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Per-connection reader loop.
async fn read_loop<S: Serializer>(
    bridge: &Bridge<S>,
    channel: &TcpChannel,
    mut reader: OwnedReadHalf,
    mut reassembler: FrameReassembler,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let id = channel.id();
    let mut closed = channel.close_signal();

    loop {
        tokio::select! {
            result = read_frames(&mut reader, &mut reassembler) => {
                match result {
                    Ok(frames) => {
                        for frame in frames {
                            bridge.receive(frame.into_frame(), id);
                        }
                    }
                    Err(FrameError::ConnectionClosed) => {
                        if reassembler.has_pending() {
                            bridge.discard(id, reassembler.take_pending());
                        }
                        bridge.close(id, CloseCause::User);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = %id, "Closing connection: {e}");
                        if reassembler.has_pending() {
                            bridge.discard(id, reassembler.take_pending());
                        }
                        bridge.close(id, CloseCause::System);
                        break;
                    }
                }
            }
            _ = closed.changed() => {
                // Closed by the bridge (timeout, replacement or destroy).
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    bridge.close(id, CloseCause::System);
                    break;
                }
            }
        }
    }
    channel.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use crate::bridge::{BridgeConfig, DEFAULT_TOPIC};
    use crate::bus::Bus;
    use crate::datagram::{DEFAULT_VERSION, DatagramType, encode, heartbeat};
    use crate::envelope::BridgeEnvelope;
    use crate::events::{BridgeEvent, EventKind};
    use crate::queue::InboundQueue;

    type Seen = Arc<Mutex<Vec<(String, EventKind)>>>;

    async fn start_transport(
        max_connections: usize,
    ) -> (SocketAddr, Arc<TcpTransport>, Arc<Bridge>, Seen) {
        let bridge = Arc::new(Bridge::new(
            BridgeConfig::default(),
            Arc::new(InboundQueue::new()),
            Arc::new(Bus::new()),
        ));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.add_listener(Arc::new(move |id: &str, event: &BridgeEvent| {
            sink.lock().push((id.to_string(), event.kind()));
        }));
        bridge.init().unwrap();

        let config = TransportConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            ..Default::default()
        };
        let transport = Arc::new(TcpTransport::new(config, Arc::clone(&bridge)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let t = Arc::clone(&transport);
        tokio::spawn(async move {
            t.run_with_listener(listener).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (addr, transport, bridge, seen)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn app_frame(body: &[u8]) -> Vec<u8> {
        encode(body, DEFAULT_VERSION, DatagramType::Application)
            .unwrap()
            .into_frame()
    }

    #[tokio::test]
    async fn test_accepted_socket_is_registered() {
        let (addr, _transport, bridge, seen) = start_transport(16).await;
        let _stream = TcpStream::connect(addr).await.unwrap();

        wait_until(|| bridge.registry().len() == 1).await;
        assert_eq!(bridge.registry().ids(), vec!["conn-1".to_string()]);
        assert_eq!(
            *seen.lock(),
            vec![("conn-1".to_string(), EventKind::Register)]
        );
    }

    #[tokio::test]
    async fn test_split_frames_reach_queue_in_order() {
        let (addr, _transport, bridge, _) = start_transport(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut bytes = app_frame(b"first");
        bytes.extend(heartbeat(DEFAULT_VERSION).into_frame());
        bytes.extend(app_frame(b"second"));
        for piece in bytes.chunks(7) {
            stream.write_all(piece).await.unwrap();
            stream.flush().await.unwrap();
        }

        let queue = Arc::clone(bridge.queue());
        let got = tokio::task::spawn_blocking(move || {
            let first = queue.poll_first(Duration::from_secs(5));
            let second = queue.poll_first(Duration::from_secs(5));
            (first, second)
        })
        .await
        .unwrap();

        assert_eq!(got.0.unwrap().body, app_frame(b"first"));
        assert_eq!(got.1.unwrap().body, app_frame(b"second"));
    }

    #[tokio::test]
    async fn test_published_envelope_is_written_to_socket() {
        let (addr, _transport, bridge, _) = start_transport(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_until(|| bridge.registry().len() == 1).await;

        let frame = app_frame(b"reply");
        bridge
            .bus()
            .publish(DEFAULT_TOPIC, &BridgeEnvelope::new(frame.clone(), "conn-1"))
            .unwrap();

        let mut buf = vec![0u8; frame.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, frame);
    }

    #[tokio::test]
    async fn test_disconnect_with_partial_frame_discards() {
        let (addr, _transport, bridge, seen) = start_transport(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&app_frame(b"cut short")[..10]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);

        wait_until(|| bridge.registry().is_empty()).await;
        wait_until(|| seen.lock().iter().any(|(_, k)| *k == EventKind::Unregister)).await;

        let kinds: Vec<EventKind> = seen.lock().iter().map(|(_, k)| *k).collect();
        assert!(kinds.contains(&EventKind::Discard));
        assert_eq!(kinds.last(), Some(&EventKind::Unregister));
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let (addr, _transport, bridge, _) = start_transport(2).await;
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        wait_until(|| bridge.registry().len() == 2).await;

        let _c3 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (addr, transport, bridge, _) = start_transport(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wait_until(|| bridge.registry().len() == 1).await;

        transport.shutdown();
        wait_until(|| bridge.registry().is_empty()).await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "client should see EOF after shutdown");
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), "conn-1");
        assert_eq!(ids.next_id(), "conn-2");
    }
}
