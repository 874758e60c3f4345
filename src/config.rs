//! Configuration system for the MQTT log shipper
//!
//! The shipper is configured from a TOML file with four sections:
//! `[shipper]` identity, `[mqtt]` broker binding, `[reconnect]` backoff policy
//! and `[buffer]` queueing. Only the `[mqtt]` section can be re-applied to a
//! running handler, through [`HandlerConfiguration`].

use crate::qos::QualityOfService;
use crate::transport::mqtt::{parse_connection_string, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Complete shipper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShipperConfig {
    #[serde(default)]
    pub shipper: ShipperSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub buffer: BufferSection,
}

/// Process identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShipperSection {
    /// Stable instance identifier; a random UUID is generated when omitted
    #[serde(default = "generate_instance_id")]
    pub instance_id: String,
    /// Prefix of the MQTT client identifier (`<prefix>-<instance_id>`)
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Origin token for entries that do not carry one
    pub origin: Option<String>,
}

impl Default for ShipperSection {
    fn default() -> Self {
        Self {
            instance_id: generate_instance_id(),
            client_id_prefix: default_client_id_prefix(),
            origin: None,
        }
    }
}

impl ShipperSection {
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, self.instance_id)
    }

    pub fn default_origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.instance_id)
    }
}

fn generate_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_client_id_prefix() -> String {
    "log-shipper".to_string()
}

/// Broker binding; this is the hot-reloadable part of the configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker address, e.g. `mqtt://broker:1883` or `mqtts://broker`
    pub connection_string: String,
    /// Delivery guarantee for published entries (0, 1 or 2)
    #[serde(default)]
    pub qos: QualityOfService,
    /// Keep-alive interval in seconds; 0 disables keep-alive
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    /// First level of every publish topic
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

fn default_keep_alive() -> u16 {
    60
}

fn default_topic_prefix() -> String {
    "logs".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

impl MqttSection {
    /// Section with defaults for everything but the address
    pub fn new(connection_string: impl Into<String>, qos: QualityOfService) -> Self {
        Self {
            connection_string: connection_string.into(),
            qos,
            keep_alive_secs: default_keep_alive(),
            topic_prefix: default_topic_prefix(),
            username_env: None,
            password_env: None,
            connect_timeout_secs: default_connect_timeout(),
            publish_timeout_ms: default_publish_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connection_string must not be empty".to_string(),
            ));
        }

        parse_connection_string(&self.connection_string)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        validate_topic_prefix(&self.topic_prefix)?;

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.publish_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_packet_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether switching to `other` needs a new connection
    ///
    /// QoS and topic prefix are shared with live senders; every other
    /// field is captured by the connection when it is built.
    pub fn requires_reconnect(&self, other: &MqttSection) -> bool {
        self.connection_string != other.connection_string
            || self.keep_alive_secs != other.keep_alive_secs
            || self.connect_timeout_secs != other.connect_timeout_secs
            || self.publish_timeout_ms != other.publish_timeout_ms
            || self.username_env != other.username_env
            || self.password_env != other.password_env
            || self.max_packet_size != other.max_packet_size
    }

    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// MQTT topic levels cannot hold wildcards and the prefix must be non-empty
fn validate_topic_prefix(prefix: &str) -> Result<(), ConfigError> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "mqtt.topic_prefix must not be empty".to_string(),
        ));
    }
    if trimmed.contains(['+', '#', '\0']) {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.topic_prefix '{prefix}' must not contain '+', '#' or NUL"
        )));
    }
    Ok(())
}

/// Reconnect policy as written in the file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay to randomize, 0.0 to 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    pub max_attempts: Option<u32>,
    pub max_duration_secs: Option<u64>,
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
            max_duration_secs: None,
        }
    }
}

impl ReconnectSection {
    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            multiplier: self.multiplier,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            max_duration: self.max_duration_secs.map(Duration::from_secs),
        }
    }
}

/// Queueing and delivery-retry settings for the service host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_capacity() -> usize {
    1024
}

fn default_drain_timeout() -> u64 {
    5000
}

fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            drain_timeout_ms: default_drain_timeout(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl BufferSection {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration pushed to a running handler
///
/// The `type` tag is checked at the boundary: anything that is not an MQTT
/// handler configuration deserializes to `Unsupported` and is rejected by the
/// handler without touching its current configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfiguration {
    Mqtt(MqttSection),
    #[serde(other)]
    Unsupported,
}

impl HandlerConfiguration {
    /// Parse a standalone handler configuration document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

impl From<MqttSection> for HandlerConfiguration {
    fn from(section: MqttSection) -> Self {
        HandlerConfiguration::Mqtt(section)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid instance ID format: {0}")]
    InvalidInstanceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ShipperConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ShipperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_instance_id(&self.shipper.instance_id)?;
        self.mqtt.validate()?;
        self.to_reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        if self.buffer.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer.capacity must be greater than 0".to_string(),
            ));
        }
        if self.buffer.max_delivery_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer.max_delivery_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        self.reconnect.to_reconnect_config()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[shipper]
instance_id = "test-instance"

[mqtt]
connection_string = "mqtt://localhost:1883"
qos = 1
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Client identifiers end up in MQTT client IDs, keep them to a safe charset
fn validate_instance_id(instance_id: &str) -> Result<(), ConfigError> {
    let valid_chars = instance_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if instance_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidInstanceId(format!(
            "Instance ID '{instance_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
