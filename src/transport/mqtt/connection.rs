//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! configuration handling, and topic construction.

use super::ack_tracker::DeliveryError;
use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnect policy exhausted or broker refused the session
    PermanentlyDisconnected(String),
    /// Intentionally closed by the owner
    Closed,
}

impl ConnectionState {
    /// Terminal states never return to `Connected` on their own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::PermanentlyDisconnected(_) | ConnectionState::Closed
        )
    }
}

/// Reconnection policy: exponential backoff with jitter and optional cutoffs
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    pub initial_delay_ms: u64,
    /// Upper bound for the un-jittered delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Give up once disconnected for this long (None = unlimited)
    pub max_duration: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
            max_duration: None,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered backoff delay for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    /// Spread `delay_ms` by the jitter fraction; `sample` is uniform in [0, 1)
    pub fn apply_jitter(&self, delay_ms: u64, sample: f64) -> u64 {
        let spread = delay_ms as f64 * self.jitter.clamp(0.0, 1.0);
        let jittered = delay_ms as f64 - spread + 2.0 * spread * sample.clamp(0.0, 1.0);
        jittered.round().max(0.0) as u64
    }

    /// Backoff delay for the attempt with random jitter applied
    pub fn jittered_delay(&self, attempt: u32) -> u64 {
        use rand::Rng;
        let sample = rand::rng().random::<f64>();
        self.apply_jitter(self.calculate_backoff_delay(attempt), sample)
    }

    /// Upper bound on the time spent sleeping across all attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        let by_attempts = self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| {
                    let delay = self.calculate_backoff_delay(attempt) as f64;
                    (delay * (1.0 + self.jitter.clamp(0.0, 1.0))).ceil() as u64
                })
                .sum::<u64>()
        });
        let by_duration = self.max_duration.map(|d| d.as_millis() as u64);

        match (by_attempts, by_duration) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (a, d) => a.or(d),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("initial_delay_ms must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must be at least initial_delay_ms".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be a finite number >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0.0 and 1.0".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.max_duration == Some(Duration::ZERO) {
            return Err("max_duration must be greater than 0 or None for unlimited".to_string());
        }
        Ok(())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),
    #[error("ConnAck timeout - no connection confirmation within {timeout_secs}s")]
    ConnAckTimeout { timeout_secs: u64 },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("No delivery confirmation within {timeout_ms}ms")]
    PublishTimeout { timeout_ms: u64 },
    #[error("Connection supervisor already started")]
    AlreadyStarted,
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Broker endpoint parsed from a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a connection string into a broker address
///
/// Accepts any `scheme://host[:port]` form. `mqtts`, `ssl` and `tls` schemes
/// enable TLS with a default port of 8883, everything else is plain TCP on
/// 1883. A bare `host[:port]` is read as `mqtt://host[:port]`.
pub fn parse_connection_string(connection_string: &str) -> Result<BrokerAddress, MqttError> {
    let trimmed = connection_string.trim();
    let invalid = || MqttError::InvalidBrokerUrl(connection_string.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("mqtt://{trimmed}")
    };

    let url = Url::parse(&candidate).map_err(|_| invalid())?;
    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(invalid)?;

    let tls = matches!(url.scheme(), "mqtts" | "ssl" | "tls");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Pure function to configure MQTT options from config
/// Shared by the initial connection and every reconnection attempt
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let address = parse_connection_string(&config.connection_string)?;
    let mut mqtt_options = MqttOptions::new(client_id, address.host, address.port);

    if address.tls {
        let transport = RumqttcTransport::tls_with_default_config();
        mqtt_options.set_transport(transport);
    }

    // Credentials are resolved from the environment on every attempt
    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
    mqtt_options.set_max_packet_size(Some(config.max_packet_size));

    Ok(mqtt_options)
}

/// Topic construction for shipped log entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: canonicalize_topic(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the log topic for an origin: `{prefix}/{origin}`
    ///
    /// Publish topics must not contain wildcards, so origins carrying `+`,
    /// `#` or NUL are refused rather than rewritten.
    pub fn build_log_topic(&self, origin: &str) -> Result<String, String> {
        let origin = canonicalize_topic(origin);
        if origin.is_empty() {
            return Err("origin is empty".to_string());
        }
        if origin.contains(['+', '#', '\0']) {
            return Err("origin contains an MQTT wildcard or NUL".to_string());
        }
        Ok(canonicalize_topic(&format!("{}/{}", self.prefix, origin)))
    }
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new("logs")
    }
}

/// Topic builder shared by a handler and its live senders
///
/// Replacing it makes every sender use the new prefix on its next publish.
#[derive(Debug, Default)]
pub struct SharedTopics {
    inner: RwLock<TopicBuilder>,
}

impl SharedTopics {
    pub fn new(builder: TopicBuilder) -> Self {
        Self {
            inner: RwLock::new(builder),
        }
    }

    pub fn load(&self) -> TopicBuilder {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new builder, returning the previous one
    pub fn store(&self, builder: TopicBuilder) -> TopicBuilder {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, builder)
    }

    pub fn build_log_topic(&self, origin: &str) -> Result<String, String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build_log_topic(origin)
    }
}

/// Drop empty topic levels: no leading, trailing or doubled slashes
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
