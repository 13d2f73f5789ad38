//! Configuration system for the strand protocol server.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and support change detection on reload.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClientConfig, Config, DispatchConfig, LogConfig, MIN_HEARTBEAT_SECS, ProtocolConfig,
    ServerConfig,
};
pub use error::ConfigError;
