//! The transport bridge: connects raw transport frames to the application.
//!
//! Inbound, the bridge classifies frames, refreshes connection liveness and
//! pushes application frames onto the [`InboundQueue`]. Outbound, it listens
//! on a bus topic and writes every published [`BridgeEnvelope`] to its
//! destination channel. Lifecycle events are fanned out through an
//! [`EventHub`] independently of the data path.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use crate::bus::{Bus, Listener, ListenerKey};
use crate::channel::{ChannelError, ChannelRef};
use crate::datagram;
use crate::envelope::BridgeEnvelope;
use crate::events::{BridgeEvent, CloseCause, EventHub, EventListener};
use crate::queue::InboundQueue;
use crate::registry::{
    Connection, ConnectionRegistry, HeartbeatSweeper, MIN_HEARTBEAT_TIMEOUT, Registration,
    sweep_period,
};
use crate::serializer::{JsonSerializer, Serializer};

/// Default bus topic carrying outbound envelopes.
pub const DEFAULT_TOPIC: &str = "/protocol/receive";

/// Errors returned by [`Bridge`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The bridge has not been initialized.
    #[error("bridge is not initialized")]
    NotInitialized,

    /// The bridge has been destroyed.
    #[error("bridge has been destroyed")]
    Destroyed,

    /// No connection is registered under the id.
    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    /// Writing to the channel failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A background thread could not be started.
    #[error("failed to spawn bridge thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Idle time after which a connection is evicted.
    pub heartbeat_timeout: Duration,
    /// Bus topic the bridge listens on for outbound envelopes.
    pub topic: String,
}

impl BridgeConfig {
    /// Settings with the heartbeat timeout raised to the 30 second floor.
    pub fn new(heartbeat_timeout: Duration, topic: impl Into<String>) -> Self {
        Self {
            heartbeat_timeout: heartbeat_timeout.max(MIN_HEARTBEAT_TIMEOUT),
            topic: topic.into(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(MIN_HEARTBEAT_TIMEOUT, DEFAULT_TOPIC)
    }
}

struct Inbound {
    connection_id: String,
    bytes: Vec<u8>,
}

struct Runtime {
    sweeper: HeartbeatSweeper,
    intake_tx: Sender<Inbound>,
    intake: JoinHandle<()>,
    delivery: ListenerKey,
}

enum Lifecycle {
    Created,
    Running(Runtime),
    Destroyed,
}

/// Queue-mediated bridge between transport and dispatch.
pub struct Bridge<S: Serializer = JsonSerializer> {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventHub>,
    queue: Arc<InboundQueue>,
    bus: Arc<Bus<S>>,
    state: Mutex<Lifecycle>,
}

impl<S: Serializer> Bridge<S> {
    /// Create a bridge over a shared queue and bus. Call [`Bridge::init`]
    /// before use.
    pub fn new(config: BridgeConfig, queue: Arc<InboundQueue>, bus: Arc<Bus<S>>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(config.heartbeat_timeout)),
            events: Arc::new(EventHub::new()),
            config,
            queue,
            bus,
            state: Mutex::new(Lifecycle::Created),
        }
    }

    /// Start the heartbeat sweeper and intake thread and subscribe to the
    /// outbound topic. Repeated calls are no-ops.
    pub fn init(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Running(_) => {
                tracing::debug!("Bridge already initialized");
                return Ok(());
            }
            Lifecycle::Destroyed => {
                tracing::warn!("Bridge init called after destroy");
                return Err(BridgeError::Destroyed);
            }
            Lifecycle::Created => {}
        }

        let events = Arc::clone(&self.events);
        let sweeper = HeartbeatSweeper::spawn(
            Arc::clone(&self.registry),
            sweep_period(self.config.heartbeat_timeout),
            move |connection: Arc<Connection>| {
                events.publish(
                    connection.id(),
                    BridgeEvent::Unregister {
                        cause: CloseCause::Timeout,
                    },
                );
            },
        )?;

        let (intake_tx, intake_rx) = unbounded::<Inbound>();
        let registry = Arc::clone(&self.registry);
        let events = Arc::clone(&self.events);
        let queue = Arc::clone(&self.queue);
        let intake = std::thread::Builder::new()
            .name("bridge-intake".into())
            .spawn(move || {
                for inbound in intake_rx {
                    classify(&registry, &events, &queue, inbound);
                }
                tracing::debug!("Bridge intake stopped");
            })?;

        let delivery = self.bus.register(
            &self.config.topic,
            Arc::new(Delivery {
                registry: Arc::clone(&self.registry),
                events: Arc::clone(&self.events),
            }),
        );

        tracing::info!(topic = %self.config.topic, "Bridge initialized");
        *state = Lifecycle::Running(Runtime {
            sweeper,
            intake_tx,
            intake,
            delivery,
        });
        Ok(())
    }

    /// Stop background work, close every connection and drop all listeners.
    /// Repeated calls are no-ops.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Destroyed);
        let Lifecycle::Running(runtime) = previous else {
            return;
        };

        let Runtime {
            mut sweeper,
            intake_tx,
            intake,
            delivery,
        } = runtime;
        self.bus.unregister(delivery);
        sweeper.stop();
        drop(intake_tx);
        if intake.join().is_err() {
            tracing::error!("Bridge intake thread panicked");
        }

        for id in self.registry.ids() {
            self.close(&id, CloseCause::System);
        }
        self.registry.clear();
        self.events.clear();
        tracing::info!("Bridge destroyed");
    }

    /// Whether [`Bridge::init`] has run and [`Bridge::destroy`] has not.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Running(_))
    }

    /// Add a lifecycle observer.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.events.register(listener);
    }

    /// Track a newly connected channel.
    pub fn register(&self, channel: ChannelRef) -> Result<(), BridgeError> {
        self.ensure_running()?;
        let id = channel.id().to_string();
        match self.registry.register(channel) {
            Registration::Inserted => {
                tracing::debug!(connection_id = %id, "Connection registered");
                self.events.publish(&id, BridgeEvent::Register);
            }
            Registration::Duplicate => {
                tracing::trace!(connection_id = %id, "Connection already registered");
            }
            Registration::Replaced(old) => {
                tracing::warn!(connection_id = %id, "Connection id reused, closing previous channel");
                old.channel().close();
                self.events.publish(
                    &id,
                    BridgeEvent::Unregister {
                        cause: CloseCause::System,
                    },
                );
            }
        }
        Ok(())
    }

    /// Accept one complete frame from the transport.
    ///
    /// Classification happens on the intake thread; failures surface as
    /// [`BridgeEvent::ReceivedError`] and are never returned to the caller.
    pub fn receive(&self, bytes: Vec<u8>, connection_id: &str) {
        self.events.publish(
            connection_id,
            BridgeEvent::Received {
                bytes: bytes.clone(),
            },
        );

        let state = self.state.lock();
        let Lifecycle::Running(runtime) = &*state else {
            tracing::warn!(connection_id, "Frame received while bridge is not running");
            return;
        };
        let inbound = Inbound {
            connection_id: connection_id.to_string(),
            bytes,
        };
        if runtime.intake_tx.send(inbound).is_err() {
            tracing::error!(connection_id, "Bridge intake is gone");
        }
    }

    /// Remove a connection and close its channel. Returns `false` if the
    /// connection was already gone.
    pub fn close(&self, connection_id: &str, cause: CloseCause) -> bool {
        let Some(connection) = self.registry.remove(connection_id) else {
            return false;
        };
        connection.channel().close();
        tracing::debug!(connection_id, ?cause, "Connection closed");
        self.events
            .publish(connection_id, BridgeEvent::Unregister { cause });
        true
    }

    /// Report bytes left unread when the transport disconnected.
    pub fn discard(&self, connection_id: &str, bytes: Vec<u8>) {
        tracing::debug!(connection_id, len = bytes.len(), "Discarding unread bytes");
        self.events
            .publish(connection_id, BridgeEvent::Discard { bytes });
    }

    /// Write an outbound envelope to its connection.
    pub fn send(&self, envelope: BridgeEnvelope) -> Result<(), BridgeError> {
        deliver(&self.registry, &self.events, envelope)
    }

    /// Bridge settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Inbound queue shared with the dispatch engine.
    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    /// Bus carrying outbound envelopes.
    pub fn bus(&self) -> &Arc<Bus<S>> {
        &self.bus
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        match *self.state.lock() {
            Lifecycle::Running(_) => Ok(()),
            Lifecycle::Created => Err(BridgeError::NotInitialized),
            Lifecycle::Destroyed => Err(BridgeError::Destroyed),
        }
    }
}

impl<S: Serializer> Drop for Bridge<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ---------------------------------------------------------------------------
// Inbound classification and outbound delivery
// ---------------------------------------------------------------------------

fn classify(
    registry: &ConnectionRegistry,
    events: &EventHub,
    queue: &InboundQueue,
    inbound: Inbound,
) {
    let Inbound {
        connection_id,
        bytes,
    } = inbound;

    if !registry.touch(&connection_id) {
        tracing::warn!(connection_id = %connection_id, "Frame for unknown connection");
        events.publish(
            &connection_id,
            BridgeEvent::ReceivedError {
                reason: format!("connection {connection_id} not found"),
            },
        );
        return;
    }

    let frame = match datagram::decode(&bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, "Undecodable frame: {e}");
            events.publish(
                &connection_id,
                BridgeEvent::ReceivedError {
                    reason: e.to_string(),
                },
            );
            return;
        }
    };

    if frame.is_heartbeat() {
        tracing::trace!(connection_id = %connection_id, "Heartbeat");
        return;
    }
    queue.push_back(BridgeEnvelope::new(frame.into_frame(), connection_id));
}

fn deliver(
    registry: &ConnectionRegistry,
    events: &EventHub,
    envelope: BridgeEnvelope,
) -> Result<(), BridgeError> {
    let id = envelope.connection_id.clone();
    let Some(connection) = registry.get(&id) else {
        tracing::debug!(connection_id = %id, "Send to unknown connection");
        return Err(BridgeError::ConnectionNotFound(id));
    };

    events.publish(
        &id,
        BridgeEvent::ReceivedSuccess {
            envelope: envelope.clone(),
        },
    );
    connection.channel().write(envelope.body.clone())?;
    events.publish(&id, BridgeEvent::Send { envelope });
    Ok(())
}

/// Bus subscriber that forwards published envelopes to their connections.
struct Delivery {
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventHub>,
}

impl Listener for Delivery {
    type Message = BridgeEnvelope;

    fn on_message(&self, _topic: &str, envelope: BridgeEnvelope) {
        let connection_id = envelope.connection_id.clone();
        if let Err(e) = deliver(&self.registry, &self.events, envelope) {
            tracing::warn!(connection_id = %connection_id, "Outbound delivery failed: {e}");
        }
    }
}
