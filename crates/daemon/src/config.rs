//! Configuration management for the Emberlink daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/emberlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be host:port, got {0}")]
    InvalidListenAddr(String),

    #[error("handshake_timeout_secs must be between 1 and 300, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("chunk_size must be a power of two between 64 and 4096, got {0}")]
    InvalidChunkSize(u16),

    #[error("max_binary_size must be greater than 0, got {0}")]
    InvalidMaxBinarySize(u32),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Emberlink daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Device listener configuration.
    pub server: ServerConfig,

    /// Protocol timing knobs.
    pub protocol: ProtocolConfig,

    /// Firmware update knobs.
    pub ota: OtaConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (server keys, device keys).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Device listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the device listener binds to.
    pub listen_addr: String,
}

/// Protocol timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Ceiling on the whole handshake exchange, in seconds.
    pub handshake_timeout_secs: u64,

    /// Ceiling on a single socket read during the handshake, in seconds.
    pub read_timeout_secs: u64,

    /// Ceiling on a correlated RPC response, in seconds.
    pub response_timeout_secs: u64,
}

/// Firmware update knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// Chunk size in bytes; the final chunk is zero-padded to this width.
    pub chunk_size: u16,

    /// Upper bound accepted for a firmware image when the device does not
    /// declare its own maximum.
    pub max_binary_size: u32,

    /// Whether fast (no per-chunk acknowledgment) transfer is offered.
    pub fast_ota: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5683".to_string(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            read_timeout_secs: 30,
            response_timeout_secs: 30,
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            max_binary_size: 128 * 1024,
            fast_ota: true,
        }
    }
}

impl ProtocolConfig {
    /// Whole-handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Single-read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Correlated-response deadline.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emberlink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emberlink")
}

impl Config {
    /// Loads configuration from the given path, or returns defaults when
    /// the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validates field ranges.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.server.listen_addr.contains(':') {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }
        let timeout = self.protocol.handshake_timeout_secs;
        if timeout == 0 || timeout > 300 {
            return Err(ConfigError::InvalidHandshakeTimeout(timeout));
        }
        let chunk = self.ota.chunk_size;
        if !chunk.is_power_of_two() || !(64..=4096).contains(&chunk) {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }
        if self.ota.max_binary_size == 0 {
            return Err(ConfigError::InvalidMaxBinarySize(self.ota.max_binary_size));
        }
        if !VALID_LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }
        Ok(())
    }
}
