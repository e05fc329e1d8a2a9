//! Configuration management for chatd.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/chatline/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{BrokenMessagePolicy, KeystreamMode, SessionOptions, DEFAULT_MAX_LINES_PER_KEY};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address of the chat server.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:10110";

/// Default address of the private message receiver.
pub const DEFAULT_PRIVATE_ADDR: &str = "127.0.0.1:10111";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_lines_per_key must be greater than 0")]
    InvalidMaxLines,

    #[error("username must not contain whitespace, got {0:?}")]
    InvalidUsername(String),

    #[error("server_addr must not be empty")]
    EmptyServerAddr,

    #[error("server and private receiver cannot both listen on {0}")]
    ConflictingListenAddr(SocketAddr),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Chat server configuration.
    pub server: ServerConfig,

    /// Chat client configuration.
    pub client: ClientConfig,

    /// Private message receiver configuration.
    pub private: PrivateConfig,

    /// Encrypted channel settings shared by server and client.
    pub channel: ChannelConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily rotated log files. Logs go to stderr if unset.
    pub log_dir: Option<PathBuf>,
}

/// Chat server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the server listens on.
    pub listen_addr: SocketAddr,

    /// The server's RSA private key (PEM).
    pub private_key: PathBuf,

    /// Directory of `<username>.pub.pem` files.
    pub users_dir: PathBuf,

    /// Seconds a client has to complete the handshake (0 = no limit).
    pub handshake_timeout_secs: u64,
}

/// Chat client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the chat server (host:port).
    pub server_addr: String,

    /// Username to authenticate as.
    pub username: String,

    /// The user's RSA private key (PEM).
    pub private_key: PathBuf,

    /// The server's RSA public key (PEM).
    pub server_public_key: PathBuf,
}

/// Private message receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrivateConfig {
    /// Address the receiver listens on.
    pub listen_addr: SocketAddr,

    /// Hex-encoded shared secret file.
    pub secret_key: PathBuf,
}

/// Encrypted channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// What to do with lines that fail to decrypt (drop, fail).
    pub broken_message_policy: BrokenMessagePolicy,

    /// Counter layout (sequenced, legacy). Legacy interoperates with peers
    /// that restart the counter per line but reuses keystream; both ends of
    /// a connection must agree.
    pub keystream_mode: KeystreamMode,

    /// Lines per direction before the session key is exhausted.
    pub max_lines_per_key: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let keys = default_keys_dir();
        Self {
            listen_addr: parse_default_addr(DEFAULT_SERVER_ADDR),
            private_key: keys.join("server.pem"),
            users_dir: keys.join("users"),
            handshake_timeout_secs: 30,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let keys = default_keys_dir();
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            username: String::new(),
            private_key: keys.join("client.pem"),
            server_public_key: keys.join("server.pub.pem"),
        }
    }
}

impl Default for PrivateConfig {
    fn default() -> Self {
        Self {
            listen_addr: parse_default_addr(DEFAULT_PRIVATE_ADDR),
            secret_key: default_keys_dir().join("private.secret"),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broken_message_policy: BrokenMessagePolicy::Drop,
            keystream_mode: KeystreamMode::Sequenced,
            max_lines_per_key: DEFAULT_MAX_LINES_PER_KEY,
        }
    }
}

fn parse_default_addr(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatline")
        .join("config.toml")
}

/// Returns the default directory for key files.
pub fn default_keys_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatline")
        .join("keys")
}

impl ServerConfig {
    /// Returns the handshake timeout, `None` if disabled.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }
}

impl ChannelConfig {
    /// Returns the options for channels produced by the handshake.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            broken_message_policy: self.broken_message_policy,
            keystream_mode: self.keystream_mode,
            max_lines_per_key: self.max_lines_per_key,
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CHATLINE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - CHATLINE_SERVER_ADDR: Override the server address the client connects to
    /// - CHATLINE_USERNAME: Override the client username
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_override("CHATLINE_LOG_LEVEL") {
            tracing::info!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }

        if let Some(addr) = env_override("CHATLINE_SERVER_ADDR") {
            tracing::info!("Overriding server_addr from environment: {}", addr);
            self.client.server_addr = addr;
        }

        if let Some(username) = env_override("CHATLINE_USERNAME") {
            tracing::info!("Overriding username from environment: {}", username);
            self.client.username = username;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.channel.max_lines_per_key == 0 {
            return Err(ConfigError::InvalidMaxLines);
        }

        // An empty username is allowed until a client actually connects.
        if self.client.username.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidUsername(self.client.username.clone()));
        }

        if self.client.server_addr.trim().is_empty() {
            return Err(ConfigError::EmptyServerAddr);
        }

        if self.server.listen_addr == self.private.listen_addr
            && self.server.listen_addr.port() != 0
        {
            return Err(ConfigError::ConflictingListenAddr(self.server.listen_addr));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
