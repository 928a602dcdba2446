//! Configuration for relay-io
//!
//! Server parameters can be built in code or loaded from a TOML file together
//! with the daemon's frame source settings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default service (port) the daemon listens on
pub const DEFAULT_SERVICE: &str = "60000";

/// Default record size: one classic CAN frame
pub const DEFAULT_RECORD_SIZE: usize = 16;

/// Default pending-connection backlog
pub const DEFAULT_BACKLOG: i32 = 5;

/// Largest record that fits one TCP segment (MSS)
pub const MAX_RECORD_SIZE: usize = 1460;

/// Service strings must be shorter than this (NI_MAXSERV)
pub const MAX_SERVICE_LEN: usize = 32;

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Service name or port number to listen on ("0" picks an ephemeral port)
    pub service: String,

    /// Size of every record sent or received, in bytes
    pub record_size: usize,

    /// Pending-connection backlog passed to listen()
    pub backlog: i32,

    /// Session log verbosity:
    /// - 0: no session log
    /// - 1: connection events and errors
    /// - 2: plus per-record summaries
    /// - 3: plus hex dump of every record
    pub log_level: u8,

    /// Directory the session log file (`tcp_<service>.log`) is written to
    pub log_dir: PathBuf,

    /// How long a broadcast waits on one stalled client before giving up
    pub send_stall_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            record_size: DEFAULT_RECORD_SIZE,
            backlog: DEFAULT_BACKLOG,
            log_level: 0,
            log_dir: PathBuf::from("."),
            send_stall_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Create a configuration for `service` with the given record size
    pub fn new(service: impl Into<String>, record_size: usize) -> Self {
        Self {
            service: service.into(),
            record_size,
            ..Self::default()
        }
    }

    /// Set the session log verbosity (0-3)
    pub fn with_log_level(mut self, level: u8) -> Self {
        self.log_level = level;
        self
    }

    /// Set the directory for the session log file
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Set the listen backlog
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the per-client broadcast stall timeout
    pub fn with_send_stall_timeout(mut self, timeout: Duration) -> Self {
        self.send_stall_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Per-client broadcast stall timeout as a `Duration`
    pub fn send_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.send_stall_timeout_ms)
    }

    /// Check every parameter before any socket is created
    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() || self.service.len() >= MAX_SERVICE_LEN {
            return Err(Error::InvalidArgument(format!(
                "service must be 1..{} bytes, got {:?}",
                MAX_SERVICE_LEN, self.service
            )));
        }
        if self.record_size == 0 || self.record_size > MAX_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "record size must be 1..={}, got {}",
                MAX_RECORD_SIZE, self.record_size
            )));
        }
        if self.backlog <= 0 {
            return Err(Error::InvalidArgument(format!(
                "backlog must be positive, got {}",
                self.backlog
            )));
        }
        if self.log_level > 3 {
            return Err(Error::InvalidArgument(format!(
                "log level must be 0..=3, got {}",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Frame source settings for the daemon
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Interval between generated frames
    pub interval_ms: u64,
    /// Number of frames to emit before going quiet (0 = unlimited)
    pub limit: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            limit: 0,
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
}

impl AppConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use relay_io::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("relay.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.server.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.service, "60000");
        assert_eq!(config.server.record_size, 16);
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.server.log_level, 0);
        assert_eq!(config.source.interval_ms, 100);
        assert!(config.server.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[server]
service = "61000"
record_size = 72
log_level = 2

[source]
interval_ms = 5
limit = 1000
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.service, "61000");
        assert_eq!(config.server.record_size, 72);
        assert_eq!(config.server.log_level, 2);
        // Unset keys fall back to defaults
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.source.limit, 1000);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");

        let mut config = AppConfig::default();
        config.server.record_size = 72;
        config.to_file(&path).unwrap();

        let loaded = AppConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::new("", 16).validate().is_err());
        assert!(ServerConfig::new("x".repeat(32), 16).validate().is_err());
        assert!(ServerConfig::new("60000", 0).validate().is_err());
        assert!(ServerConfig::new("60000", MAX_RECORD_SIZE + 1).validate().is_err());
        assert!(ServerConfig::new("60000", MAX_RECORD_SIZE).validate().is_ok());
        assert!(
            ServerConfig::new("60000", 16)
                .with_log_level(4)
                .validate()
                .is_err()
        );
        assert!(
            ServerConfig::new("60000", 16)
                .with_backlog(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[server\nservice = ").unwrap();

        assert!(matches!(AppConfig::from_file(&path), Err(Error::Config(_))));
    }
}
