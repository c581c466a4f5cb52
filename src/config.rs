//! # Configuration Management
//!
//! Centralized configuration for a Miniserver connection.
//!
//! This module provides structured configuration for the socket identity, protocol
//! timings, per-area debug output and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides with the `MINISERVER_` prefix
//!
//! ## Timing Defaults
//! The defaults mirror what the Miniserver firmware expects: a keepalive every 2s that
//! must be answered within 4s, and one-time salts that are valid for about 5s.

use crate::core::version::ServerVersion;
use crate::error::{ProtocolError, Result};
use crate::protocol::permission::Permission;
use crate::transport::WsProtocol;
use crate::utils::throughput;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Interval between two keepalive commands
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(2_000);

/// Time the Miniserver has to answer a keepalive
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(4_000);

/// A one-time salt older than this is no longer accepted (5s minus ping time)
pub const SALT_VALIDITY: Duration = Duration::from_millis(4_500);

/// Idle download connections are closed after this time
pub const DOWNLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest delay before a token is refreshed
pub const MAX_TOKEN_REFRESH_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Refresh delay used when a token's lifetime is unknown or already over
pub const MIN_TOKEN_REFRESH_DELAY: Duration = Duration::from_millis(500);

/// Download progress reporting interval
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CommunicatorConfig {
    /// Socket identity and role
    #[serde(default)]
    pub socket: SocketConfig,

    /// Protocol timings
    #[serde(default)]
    pub timing: TimingConfig,

    /// Verbose output per area
    #[serde(default)]
    pub debug: DebugConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CommunicatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(protocol) = std::env::var("MINISERVER_PROTOCOL") {
            config.socket.protocol = WsProtocol::from(protocol);
        }

        if let Ok(uuid) = std::env::var("MINISERVER_UNIQUE_ID") {
            config.socket.unique_id = uuid;
        }

        if let Ok(info) = std::env::var("MINISERVER_DEVICE_INFO") {
            config.socket.device_info = info;
        }

        if let Ok(permission) = std::env::var("MINISERVER_PERMISSION") {
            let bits = permission.parse::<u32>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid MINISERVER_PERMISSION: {permission}"))
            })?;
            config.socket.required_permission = Permission::from_bits_retain(bits);
        }

        if let Ok(version) = std::env::var("MINISERVER_VERSION") {
            config.socket.server_version = Some(version.parse()?);
        }

        if let Ok(timeout) = std::env::var("MINISERVER_OPEN_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.timing.open_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(interval) = std::env::var("MINISERVER_KEEPALIVE_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.timing.keepalive_interval = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("MINISERVER_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.socket.validate());
        errors.extend(self.timing.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Socket identity and role
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// `ws` or `wss`; unknown values fall back to `ws`
    pub protocol: WsProtocol,

    /// Device uuid sent with token requests and used as key derivation seed
    pub unique_id: String,

    /// Human readable device name sent with token requests
    pub device_info: String,

    /// Permission requested when acquiring the connection token
    pub required_permission: Permission,

    /// Download connections queue commands until authenticated and close when idle
    pub download: bool,

    /// Firmware version; taken from host resolution when unset
    pub server_version: Option<ServerVersion>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            protocol: WsProtocol::Ws,
            unique_id: String::from("098802e1-02b4-603c-ffffeee000d80cfd"),
            device_info: String::from("miniserver-protocol"),
            required_permission: Permission::APP,
            download: false,
            server_version: None,
        }
    }
}

impl SocketConfig {
    /// Validate socket configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.unique_id.trim().is_empty() {
            errors.push("Unique id cannot be empty".to_string());
        } else if self.unique_id.contains('/') {
            errors.push(format!(
                "Unique id must not contain '/': '{}'",
                self.unique_id
            ));
        }

        if self.device_info.is_empty() {
            errors.push("Device info cannot be empty".to_string());
        }

        if !self.required_permission.is_connection_permission() {
            errors.push(format!(
                "Required permission must include WEB or APP, got {}",
                self.required_permission
            ));
        }

        errors
    }
}

/// Protocol timings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,

    /// Floor of every armed socket timeout
    #[serde(with = "duration_serde")]
    pub socket_timeout: Duration,

    /// Transport open timeout, also used until enough throughput samples exist
    #[serde(with = "duration_serde")]
    pub open_timeout: Duration,

    /// A 401 after this time since the salt was requested is treated as retryable
    #[serde(with = "duration_serde")]
    pub salt_validity: Duration,

    #[serde(with = "duration_serde")]
    pub download_idle_timeout: Duration,

    /// Command salt rotation interval
    #[serde(with = "duration_serde")]
    pub salt_rotation: Duration,

    #[serde(with = "duration_serde")]
    pub max_token_refresh_delay: Duration,

    #[serde(with = "duration_serde")]
    pub min_token_refresh_delay: Duration,

    #[serde(with = "duration_serde")]
    pub progress_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            socket_timeout: throughput::constants::DEFAULT_SOCKET_TIMEOUT,
            open_timeout: throughput::constants::OPEN_CONNECTION_TIMEOUT,
            salt_validity: SALT_VALIDITY,
            download_idle_timeout: DOWNLOAD_IDLE_TIMEOUT,
            salt_rotation: crate::protocol::session::SALT_ROTATION_INTERVAL,
            max_token_refresh_delay: MAX_TOKEN_REFRESH_DELAY,
            min_token_refresh_delay: MIN_TOKEN_REFRESH_DELAY,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl TimingConfig {
    /// Validate timing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.keepalive_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        } else if self.keepalive_interval.as_secs() > 60 {
            errors.push("Keepalive interval too long (maximum: 60s)".to_string());
        }

        if self.keepalive_timeout < self.keepalive_interval {
            errors.push(
                "Keepalive timeout must not be shorter than the keepalive interval".to_string(),
            );
        }

        if self.socket_timeout.as_millis() < 100 {
            errors.push("Socket timeout too short (minimum: 100ms)".to_string());
        }

        if self.open_timeout.as_millis() < 100 {
            errors.push("Open timeout too short (minimum: 100ms)".to_string());
        } else if self.open_timeout.as_secs() > 300 {
            errors.push("Open timeout too long (maximum: 300s)".to_string());
        }

        if self.salt_validity.is_zero() {
            errors.push("Salt validity must be greater than 0".to_string());
        }

        if self.download_idle_timeout.as_secs() < 1 {
            errors.push("Download idle timeout too short (minimum: 1s)".to_string());
        }

        if self.salt_rotation.as_secs() < 1 {
            errors.push("Salt rotation interval too short (minimum: 1s)".to_string());
        }

        if self.min_token_refresh_delay > self.max_token_refresh_delay {
            errors.push("Minimum token refresh delay exceeds the maximum".to_string());
        }

        if self.progress_interval.as_millis() < 10 {
            errors.push("Progress interval too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Verbose output switches
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Connection lifecycle
    pub socket_basic: bool,
    /// Every frame and every command
    pub socket_detailed: bool,
    /// Key material and plaintexts of encrypted commands
    pub encryption: bool,
    pub download_socket: bool,
    /// Decoded event records
    pub binary_events: bool,
    pub tokens: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("miniserver-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations are written as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CommunicatorConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.timing.keepalive_interval, Duration::from_millis(2_000));
        assert_eq!(config.timing.open_timeout, Duration::from_millis(15_000));
        assert_eq!(config.socket.required_permission, Permission::APP);
    }

    #[test]
    fn test_partial_toml() {
        let config = CommunicatorConfig::from_toml(
            r#"
            [socket]
            protocol = "wss"
            download = true
            server_version = "10.2.3.26"
            required_permission = "WEB"

            [timing]
            keepalive_interval = 5000

            [debug]
            tokens = true
            "#,
        )
        .unwrap();
        assert_eq!(config.socket.protocol, WsProtocol::Wss);
        assert!(config.socket.download);
        assert_eq!(config.socket.required_permission, Permission::WEB);
        assert_eq!(
            config.socket.server_version.unwrap().to_string(),
            "10.2.3.26"
        );
        assert_eq!(config.timing.keepalive_interval, Duration::from_millis(5_000));
        assert_eq!(config.timing.keepalive_timeout, KEEPALIVE_TIMEOUT);
        assert!(config.debug.tokens);
    }

    #[test]
    fn test_unknown_protocol_falls_back() {
        let config = CommunicatorConfig::from_toml("[socket]\nprotocol = \"ftp\"\n").unwrap();
        assert_eq!(config.socket.protocol, WsProtocol::Ws);
    }

    #[test]
    fn test_example_config_roundtrips() {
        let example = CommunicatorConfig::example_config();
        let parsed = CommunicatorConfig::from_toml(&example).unwrap();
        assert_eq!(parsed.timing.salt_validity, SALT_VALIDITY);
        assert_eq!(parsed.logging.log_level, Level::INFO);
    }
}
