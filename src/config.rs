//! Connection and session configuration
//!
//! [`ConnectionConfig`] holds the typed, validated settings for one broker
//! connection. [`SessionConfig`] is the TOML file layout used by the
//! command-line client:
//!
//! ```toml
//! [mqtt]
//! address = "tcp://broker.local:1883"
//! client_id = "sensor-gateway"
//! keep_alive_secs = 20
//! request_timeout_ms = 1000
//! clean_session = true
//!
//! [reconnect]
//! interval_secs = 5
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::protocol::TopicError;

pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 20;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Client-side session persistence mode handed to the transport on create.
///
/// Only `none` is supported; session state lives with the broker when
/// `clean_session` is false.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Persistence {
    #[default]
    None,
}

/// Settings for a single broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Transport URI, e.g. `tcp://broker:1883` or `ssl://broker:8883`
    #[serde(default)]
    pub address: String,
    /// MQTT client identifier
    #[serde(default)]
    pub client_id: String,
    /// Keep-alive interval in whole seconds (fractions are truncated)
    #[serde(
        default = "default_keep_alive_secs",
        deserialize_with = "deserialize_truncated_u16"
    )]
    pub keep_alive_secs: u16,
    /// Handshake timeout in whole milliseconds (fractions are truncated)
    #[serde(
        default = "default_request_timeout_ms",
        deserialize_with = "deserialize_truncated_u64"
    )]
    pub request_timeout_ms: u64,
    /// Ask the broker to discard prior session state on connect
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Environment variable containing the username
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable containing the password
    #[serde(default)]
    pub password_env: Option<String>,
    /// Largest packet accepted or sent, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default)]
    pub persistence: Persistence,
}

fn default_keep_alive_secs() -> u16 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_clean_session() -> bool {
    true
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

/// Numbers in config files may be written as integers or decimals
#[derive(Deserialize)]
#[serde(untagged)]
enum WholeOrFractional {
    Whole(i64),
    Fractional(f64),
}

/// Truncate toward zero; negatives and non-finite values are rejected
fn truncate_non_negative(value: WholeOrFractional) -> Result<u64, String> {
    match value {
        WholeOrFractional::Whole(v) if v >= 0 => Ok(v as u64),
        WholeOrFractional::Fractional(v) if v.is_finite() && v >= 0.0 => Ok(v.trunc() as u64),
        WholeOrFractional::Whole(v) => Err(format!("expected a non-negative number, got {v}")),
        WholeOrFractional::Fractional(v) => {
            Err(format!("expected a non-negative number, got {v}"))
        }
    }
}

fn deserialize_truncated_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = WholeOrFractional::deserialize(deserializer)?;
    truncate_non_negative(raw).map_err(de::Error::custom)
}

fn deserialize_truncated_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = deserialize_truncated_u64(deserializer)?;
    u16::try_from(value)
        .map_err(|_| de::Error::custom(format!("{value} exceeds the maximum of {}", u16::MAX)))
}

impl ConnectionConfig {
    /// Create a configuration with default keep-alive, timeout and clean session
    pub fn new<A: Into<String>, C: Into<String>>(address: A, client_id: C) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            clean_session: true,
            username_env: None,
            password_env: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            persistence: Persistence::None,
        }
    }

    /// Set keep-alive; sub-second parts are truncated, saturating at `u16::MAX` seconds
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_secs = u16::try_from(keep_alive.as_secs()).unwrap_or(u16::MAX);
        self
    }

    /// Set handshake timeout; sub-millisecond parts are truncated
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Resolve credentials from these environment variables at connect time
    pub fn with_credentials_env<U: Into<String>, P: Into<String>>(
        mut self,
        username_env: U,
        password_env: P,
    ) -> Self {
        self.username_env = Some(username_env.into());
        self.password_env = Some(password_env.into());
        self
    }

    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate required fields; runs before any transport call
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingField("address"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingField("client_id"));
        }
        if self.client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidConfig(
                "client_id must not start with whitespace".to_string(),
            ));
        }
        BrokerAddress::parse(&self.address)?;
        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Username from the configured environment variable, if set
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Password from the configured environment variable, if set
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }

    /// Username and password pair; the password defaults to empty
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username()
            .map(|username| (username, self.password().unwrap_or_default()))
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Parsed transport URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URIs
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(address.trim())
            .map_err(|_| ConfigError::InvalidAddress(address.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(ConfigError::InvalidAddress(address.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Reconnect settings used by the embedding application, never by the core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_interval_secs")]
    pub interval_secs: u64,
}

fn default_reconnect_interval_secs() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_SECS
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS,
        }
    }
}

impl ReconnectSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub mqtt: ConnectionConfig,
    #[serde(default)]
    pub reconnect: Option<ReconnectSection>,
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("Invalid QoS level: {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Parse a configuration file without validating required fields.
    ///
    /// Callers that apply overrides (such as command-line flags) validate
    /// afterwards.
    pub fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        if let Some(reconnect) = &self.reconnect {
            if reconnect.interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "reconnect.interval_secs must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}
