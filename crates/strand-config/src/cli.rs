//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strand", about = "Framed TCP request dispatch server")]
pub struct CliArgs {
    /// Interface to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Heartbeat timeout in seconds (minimum 30).
    #[arg(long)]
    pub heartbeat: Option<u64>,

    /// Request worker threads (0 = one per CPU).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(secs) = args.heartbeat {
            self.protocol.heartbeat_secs = secs;
        }
        if let Some(workers) = args.workers {
            self.dispatch.workers = workers;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(9999),
            heartbeat: Some(45),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.protocol.heartbeat_secs, 45);
        assert_eq!(config.log.level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.dispatch.workers, 0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["strand", "--port", "7000", "--workers", "2"]);
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.workers, Some(2));
        assert!(args.bind.is_none());
    }
}
