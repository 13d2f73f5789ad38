//! Framed TCP protocol: wire codec, stream reassembly, connection registry,
//! the transport bridge with its queue and bus, and the reconnecting client.

pub mod bridge;
pub mod bus;
pub mod channel;
pub mod datagram;
pub mod envelope;
pub mod events;
pub mod queue;
pub mod reassembler;
pub mod registry;
pub mod serializer;
pub mod tcp_client;
pub mod tcp_server;

pub use bridge::{Bridge, BridgeConfig, BridgeError, DEFAULT_TOPIC};
pub use bus::{Bus, Listener, ListenerKey};
pub use channel::{Channel, ChannelError, ChannelInfo, ChannelRef};
pub use datagram::{Datagram, DatagramType, FrameError, HEAD_LENGTH, decode, encode};
pub use envelope::{BridgeEnvelope, InterfaceData};
pub use events::{BridgeEvent, CloseCause, EventHub, EventKind, EventListener};
pub use queue::{BridgeQueue, InboundQueue};
pub use reassembler::{FrameReassembler, ReassemblerConfig, read_frames};
pub use registry::{Connection, ConnectionRegistry, HeartbeatSweeper, Registration};
pub use serializer::{JsonSerializer, PostcardSerializer, SerializeError, Serializer};
pub use tcp_client::{
    Client, ClientError, ClientEvent, ClientListener, ClientOptions, ConnectionState,
    ConnectionStateWatch,
};
pub use tcp_server::{IdGenerator, TcpChannel, TcpTransport, TransportConfig};
