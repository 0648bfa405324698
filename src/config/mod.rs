//! Configuration management
//!
//! Settings load from an optional TOML file and are overridable by CLI flags.
//! Every field has a serde default so a partial file (or none at all) works.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading the config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Validation error
    #[error("config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on for peer connections
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peer addresses to dial at startup
    #[serde(default)]
    pub connect: Vec<String>,

    /// Shared secret for mutual authentication; open-trust mode when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Clipboard poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of recently seen events kept for request serving
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Announce-buffer capacity; overflowing announces are dropped
    #[serde(default = "default_announce_buffer")]
    pub announce_buffer: usize,

    /// Payloads above this size are announced instead of flooded, in bytes
    #[serde(default = "default_announce_threshold")]
    pub announce_threshold: usize,

    /// Per-peer write deadline in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Application handshake deadline in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Directory for received file payloads; platform data dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_dir: Option<PathBuf>,

    /// Log level filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect: Vec::new(),
            secret: None,
            poll_interval_ms: default_poll_interval_ms(),
            history_size: default_history_size(),
            announce_buffer: default_announce_buffer(),
            announce_threshold: default_announce_threshold(),
            write_timeout_ms: default_write_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            file_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket_addr()?;
        if self.poll_interval_ms < 50 {
            return Err(ConfigError::Validation(
                "poll_interval_ms below 50 would spin on the clipboard".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(ConfigError::Validation("history_size must be positive".into()));
        }
        if self.announce_buffer == 0 {
            return Err(ConfigError::Validation(
                "announce_buffer must be positive".into(),
            ));
        }
        for addr in &self.connect {
            addr.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Validation(format!("connect address '{addr}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Parsed listen address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Validation(format!("listen_addr '{}': {e}", self.listen_addr)))
    }

    /// Port component of the listen address, advertised in handshakes.
    pub fn listen_port(&self) -> u16 {
        self.listen_socket_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:7777".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_history_size() -> usize {
    128
}

fn default_announce_buffer() -> usize {
    64
}

fn default_announce_threshold() -> usize {
    512 * 1024
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen_port(), 7777);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:9000"
            secret = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_port(), 9000);
        assert_eq!(config.secret.as_deref(), Some("hunter2"));
        assert_eq!(config.poll_interval_ms, default_poll_interval_ms());
    }

    #[test]
    fn test_bad_listen_addr_rejected() {
        let config = Config {
            listen_addr: "not-an-address".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_poll_interval_rejected() {
        let config = Config {
            poll_interval_ms: 10,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clipmesh.toml");
        tokio::fs::write(&path, "listen_addr = \"127.0.0.1:8123\"\n")
            .await
            .unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.listen_port(), 8123);
    }
}
