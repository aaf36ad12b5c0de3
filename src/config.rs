//! # Configuration Management
//!
//! Centralized configuration for the client transport.
//!
//! This module provides structured configuration for the connection
//! lifecycle (endpoints, keepalive, reconnect and retry bounds) and for
//! logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Timing Considerations
//! - Keepalive probes go out on a jittered period between the min and max interval
//! - Reconnect pauses are flat random values up to a ceiling, not exponential
//! - Every retry loop is bounded so persistent failure escalates instead of spinning

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Number of equivalent server endpoints
pub const SERVER_COUNT: usize = 8;

/// Origin header sent with the WebSocket upgrade
pub const DEFAULT_ORIGIN: &str = "https://web.whatsapp.com";

/// Default outbound queue capacity
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client connection configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
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

        if let Ok(endpoints) = std::env::var("WA_TRANSPORT_ENDPOINTS") {
            config.client.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(origin) = std::env::var("WA_TRANSPORT_ORIGIN") {
            config.client.origin = origin;
        }

        if let Some(val) = env_millis("WA_TRANSPORT_HANDSHAKE_TIMEOUT_MS") {
            config.client.handshake_timeout = val;
        }

        if let Some(val) = env_millis("WA_TRANSPORT_RESPONSE_TIMEOUT_MS") {
            config.client.response_timeout = val;
        }

        if let Some(val) = env_millis("WA_TRANSPORT_RECONNECT_MAX_DELAY_MS") {
            config.client.reconnect_max_delay = val;
        }

        if let Ok(attempts) = std::env::var("WA_TRANSPORT_MAX_SEND_ATTEMPTS") {
            if let Ok(val) = attempts.parse::<u32>() {
                config.client.max_send_attempts = val;
            }
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
        errors.extend(self.client.validate());
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

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// How a keepalive probe counts towards connection health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepalivePolicy {
    /// The connection is degraded once a probe goes `probe_timeout` without any frame read
    #[default]
    RoundTrip,
    /// An unerrored probe write is enough to stay healthy
    Optimistic,
}

/// Client connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Equivalent server endpoints; one is picked at random per connect
    pub endpoints: Vec<String>,

    /// Origin header for the WebSocket upgrade
    pub origin: String,

    /// Timeout for the socket handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Default deadline used by `request_*` helpers
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Lower bound of the keepalive period
    #[serde(with = "duration_serde")]
    pub keepalive_min_interval: Duration,

    /// Upper bound of the keepalive period
    #[serde(with = "duration_serde")]
    pub keepalive_max_interval: Duration,

    /// Whether a probe needs an answer to count
    #[serde(default)]
    pub keepalive_policy: KeepalivePolicy,

    /// How long a degraded connection waits for a probe answer
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,

    /// Unanswered probes on the send path before the socket is recreated
    pub max_probe_attempts: u32,

    /// Floor of the flat random pause before each reconnect attempt
    #[serde(with = "duration_serde")]
    pub reconnect_min_delay: Duration,

    /// Ceiling of the flat random pause before each reconnect attempt
    #[serde(with = "duration_serde")]
    pub reconnect_max_delay: Duration,

    /// Ceiling of the random pause between connect attempts while a send waits
    #[serde(with = "duration_serde")]
    pub send_retry_max_pause: Duration,

    /// Deadline for one socket write; expiry counts as a failed write
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Write attempts per frame before the caller gets `SendFailure`
    pub max_send_attempts: u32,

    /// Pause before retrying a read after a non-fatal error
    #[serde(with = "duration_serde")]
    pub read_retry_delay: Duration,

    /// Capacity of the outbound queue
    pub outbound_capacity: usize,

    /// Abandoned tags remembered so late responses are dropped quietly
    pub abandoned_tag_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: (1..=SERVER_COUNT)
                .map(|n| format!("wss://w{n}.web.whatsapp.com/ws"))
                .collect(),
            origin: String::from(DEFAULT_ORIGIN),
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: timeout::DEFAULT_TIMEOUT,
            keepalive_min_interval: timeout::KEEPALIVE_MIN_INTERVAL,
            keepalive_max_interval: timeout::KEEPALIVE_MAX_INTERVAL,
            keepalive_policy: KeepalivePolicy::RoundTrip,
            probe_timeout: Duration::from_secs(10),
            max_probe_attempts: 3,
            reconnect_min_delay: Duration::ZERO,
            reconnect_max_delay: timeout::RECONNECT_MAX_DELAY,
            send_retry_max_pause: timeout::SEND_RETRY_MAX_PAUSE,
            write_timeout: timeout::WRITE_TIMEOUT,
            max_send_attempts: 5,
            read_retry_delay: timeout::READ_RETRY_DELAY,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
            abandoned_tag_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.endpoints.is_empty() {
            errors.push("At least one server endpoint is required".to_string());
        }
        for endpoint in &self.endpoints {
            if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                errors.push(format!(
                    "Invalid endpoint '{endpoint}' (expected a ws:// or wss:// URL)"
                ));
            }
        }

        if self.origin.is_empty() {
            errors.push("Origin cannot be empty".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        if self.keepalive_min_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        }
        if self.keepalive_min_interval > self.keepalive_max_interval {
            errors.push("Keepalive min interval cannot exceed max interval".to_string());
        } else if self.keepalive_max_interval.as_secs() > 3600 {
            errors.push("Keepalive interval too long (maximum: 1 hour)".to_string());
        }

        if self.probe_timeout.as_millis() < 10 {
            errors.push("Probe timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_probe_attempts == 0 {
            errors.push("Max probe attempts must be greater than 0".to_string());
        }

        if self.reconnect_min_delay > self.reconnect_max_delay {
            errors.push("Reconnect min delay cannot exceed max delay".to_string());
        } else if self.reconnect_max_delay.as_secs() > 600 {
            errors.push("Reconnect delay too long (maximum: 600s)".to_string());
        }

        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }

        if self.send_retry_max_pause.as_secs() > 60 {
            errors.push("Send retry pause too long (maximum: 60s)".to_string());
        }

        if self.max_send_attempts == 0 {
            errors.push("Max send attempts must be greater than 0".to_string());
        }

        if self.outbound_capacity == 0 {
            errors.push("Outbound capacity must be greater than 0".to_string());
        } else if self.outbound_capacity > 1_000_000 {
            errors.push(format!(
                "Outbound capacity too large: {} (max recommended: 1,000,000)",
                self.outbound_capacity
            ));
        }

        errors
    }
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to emit ANSI colors
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("wa-transport"),
            log_level: Level::INFO,
            json_format: false,
            ansi: true,
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

        if self.json_format && self.ansi {
            errors.push("ANSI colors are not supported with JSON formatting".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
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

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
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
