//! Wiring of bus, queue, bridge, dispatch engine and TCP transport.

use std::net::SocketAddr;
use std::sync::Arc;

use strand_config::Config;
use strand_dispatch::{Components, DispatchEngine, EngineConfig};
use strand_net::{
    Bridge, BridgeConfig, BridgeEvent, Bus, EventKind, EventListener, InboundQueue,
    ReassemblerConfig, TcpTransport, TransportConfig,
};
use tokio::net::TcpListener;

use crate::error::StartupError;

/// Logs connection lifecycle events.
struct ConnectionLog;

impl EventListener for ConnectionLog {
    fn focus(&self, _connection_id: &str, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::Register | EventKind::Unregister | EventKind::Discard
        )
    }

    fn on_event(&self, connection_id: &str, event: &BridgeEvent) {
        match event {
            BridgeEvent::Register => tracing::debug!(connection_id, "Connection registered"),
            BridgeEvent::Unregister { cause } => {
                tracing::debug!(connection_id, ?cause, "Connection unregistered")
            }
            BridgeEvent::Discard { bytes } => {
                tracing::warn!(connection_id, "Discarded {} unread bytes", bytes.len())
            }
            _ => {}
        }
    }
}

/// A complete server: every component shares one bus and one queue.
pub struct Stack {
    bus: Arc<Bus>,
    queue: Arc<InboundQueue>,
    bridge: Arc<Bridge>,
    engine: DispatchEngine,
    transport: Arc<TcpTransport>,
    addr: SocketAddr,
}

impl Stack {
    /// Build the components described by `config`. Nothing runs yet.
    pub fn new(config: &Config, components: Components) -> Result<Self, StartupError> {
        let addr = config.server.socket_addr()?;
        let topic = config.protocol.topic.clone();

        let bus = Arc::new(Bus::new());
        let queue = Arc::new(InboundQueue::new());
        let bridge = Arc::new(Bridge::new(
            BridgeConfig::new(config.protocol.heartbeat_timeout(), topic.clone()),
            Arc::clone(&queue),
            Arc::clone(&bus),
        ));
        bridge.add_listener(Arc::new(ConnectionLog));

        let engine = DispatchEngine::new(
            EngineConfig {
                poll_timeout: config.dispatch.poll_timeout(),
                workers: config.dispatch.workers,
                default_media_type: config.dispatch.default_media_type.clone(),
                topic,
                charset: config.protocol.charset.clone(),
                max_frame_size: config.protocol.max_frame_size as usize,
            },
            Arc::clone(&queue),
            Arc::clone(&bus),
            components,
        );

        let transport = Arc::new(TcpTransport::new(
            TransportConfig {
                bind_addr: addr,
                max_connections: config.server.max_connections,
                nodelay: config.server.nodelay,
                reassembler: ReassemblerConfig {
                    initial_capacity: config.protocol.read_buffer,
                    max_frame_size: config.protocol.max_frame_size as usize,
                },
            },
            Arc::clone(&bridge),
        ));

        Ok(Self {
            bus,
            queue,
            bridge,
            engine,
            transport,
            addr,
        })
    }

    /// Initialize the bridge and start the engine. Returns the engine name.
    pub fn start(&self) -> Result<String, StartupError> {
        self.bridge.init()?;
        let name = self.engine.start("")?;
        Ok(name)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, StartupError> {
        TcpListener::bind(self.addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: self.addr,
                source,
            })
    }

    /// Accept connections on `listener` until [`Stack::shutdown`].
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        match listener.local_addr() {
            Ok(addr) => tracing::info!("Listening on {addr}"),
            Err(e) => tracing::warn!("Listening on an unknown address: {e}"),
        }
        self.transport.run_with_listener(listener).await
    }

    /// Stop the engine, then the transport, then the bridge.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.transport.shutdown();
        self.bridge.destroy();
        tracing::info!(pending = self.queue.len(), "Server stopped");
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }
}
