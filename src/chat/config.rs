//! Channel configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default identity file, relative to the working directory.
pub const DEFAULT_IDENTITY_PATH: &str = "identity.key";

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default maximum frame body a peer may announce (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default time a peer has to send its public key.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Errors that can occur when loading a config file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a secure channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Path of the long-term identity file.
    pub identity_path: PathBuf,

    /// Address to bind when listening.
    pub bind_addr: String,

    /// Largest frame body (nonce + ciphertext) accepted from the peer.
    pub max_frame_size: usize,

    /// Seconds a connection may stay in the handshake. `None` waits forever.
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from(DEFAULT_IDENTITY_PATH),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout_secs: Some(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

impl ChannelConfig {
    /// Load a config from a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the channel cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < crate::crypto::MIN_FRAME_BODY {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {} bytes",
                crate::crypto::MIN_FRAME_BODY
            )));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "max_frame_size does not fit the 32-bit length prefix".to_string(),
            ));
        }
        if self.handshake_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Handshake deadline as a duration.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    /// Set the identity path.
    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = path.into();
        self
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Set the handshake timeout.
    ///
    /// The timeout is kept in whole seconds, so a fractional duration is
    /// rounded up with a floor of one second (1.2 s becomes 2 s, 200 ms and
    /// zero become 1 s). `None` disables it.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout_secs = timeout.map(|t| {
            let secs = t.as_secs() + u64::from(t.subsec_nanos() > 0);
            secs.max(1)
        });
        self
    }

    /// Set the maximum inbound frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}
