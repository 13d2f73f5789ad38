//! Startup error types.

use std::net::SocketAddr;

use strand_config::ConfigError;
use strand_dispatch::EngineError;
use strand_net::BridgeError;

/// Errors that abort server startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The OS did not provide a configuration directory and none was given.
    #[error("could not determine a configuration directory, pass --config")]
    NoConfigDir,

    /// Loading or interpreting the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The transport bridge could not be initialized.
    #[error("bridge startup failed: {0}")]
    Bridge(#[from] BridgeError),

    /// The dispatch engine could not start its threads.
    #[error("engine startup failed: {0}")]
    Engine(#[from] EngineError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
