//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Lower bound for the heartbeat timeout, in seconds.
pub const MIN_HEARTBEAT_SECS: u64 = 30;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening socket settings.
    pub server: ServerConfig,
    /// Wire protocol and connection liveness settings.
    pub protocol: ProtocolConfig,
    /// Request dispatch settings.
    pub dispatch: DispatchConfig,
    /// Settings used by the bundled client.
    pub client: ClientConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Listening socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
    /// Maximum concurrently registered connections.
    pub max_connections: usize,
}

/// Wire protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Seconds without any inbound frame before a connection is evicted.
    /// Values below [`MIN_HEARTBEAT_SECS`] are raised to it.
    pub heartbeat_secs: u64,
    /// Largest accepted frame, header included.
    pub max_frame_size: u32,
    /// Initial per-connection read buffer size in bytes.
    pub read_buffer: usize,
    /// Bus topic carrying outbound envelopes from dispatch to the transport.
    pub topic: String,
    /// Charset tag written into outgoing frame headers.
    pub charset: String,
}

/// Request dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bridge queue poll timeout in milliseconds.
    pub poll_timeout_ms: u64,
    /// Request worker threads (0 = one per CPU).
    pub workers: usize,
    /// Media type used when a resource declares none.
    pub default_media_type: String,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Idle seconds before the client sends a heartbeat frame.
    pub heartbeat_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "debug", "info,strand_net=trace").
    pub level: String,
    /// Also write structured JSON logs to `strand.log` in [`LogConfig::dir`].
    pub json_file: bool,
    /// Directory for the JSON log file.
    pub dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 10051,
            nodelay: true,
            max_connections: 1024,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: MIN_HEARTBEAT_SECS,
            max_frame_size: i32::MAX as u32,
            read_buffer: 1024,
            topic: "/protocol/receive".to_string(),
            charset: "UTF-8".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 200,
            workers: 0,
            default_media_type: "json".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10051,
            heartbeat_secs: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
            dir: None,
        }
    }
}

// --- Derived values ---

impl ServerConfig {
    /// Resolve the listening socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_address, self.port);
        raw.parse().map_err(|_| ConfigError::InvalidAddress(raw))
    }
}

impl ProtocolConfig {
    /// Heartbeat timeout with the minimum applied.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(MIN_HEARTBEAT_SECS))
    }
}

impl DispatchConfig {
    /// Queue poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file: returns `Some(new_config)` if it changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
