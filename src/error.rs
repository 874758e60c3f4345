//! Error taxonomy for the log shipper
//!
//! Every failure surfaces as a typed result. Activation failures leave the
//! handler inert, send failures make the host discard its sender, and
//! rejected configuration leaves the previous configuration in place.

use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Failure to establish the broker connection during activation
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("No connection acknowledgement within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Handler is already active or activating")]
    AlreadyActive,
}

impl From<MqttError> for ConnectError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::InvalidBrokerUrl(url) => ConnectError::InvalidAddress(url),
            MqttError::ConnectionRefused(reason) => ConnectError::Refused(reason),
            MqttError::ConnAckTimeout { timeout_secs } => ConnectError::Timeout { timeout_secs },
            other => ConnectError::Failed(other.to_string()),
        }
    }
}

/// Failure of a single `try_send` call
///
/// Any failure means the sender's session is no longer usable.
#[derive(Debug, Error)]
pub enum SendFailure {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Sender has been disposed")]
    Disposed,

    #[error("Cannot derive a publish topic from origin '{origin}': {reason}")]
    InvalidTarget { origin: String, reason: String },

    #[error("Failed to encode log entry")]
    Encode(#[from] EncodeError),

    #[error("Publish failed")]
    Publish(#[source] MqttError),
}

impl SendFailure {
    /// A failed send never leaves a session worth reusing
    pub fn session_usable(&self) -> bool {
        false
    }

    /// Whether the failure happened before anything reached the transport
    pub fn is_not_connected(&self) -> bool {
        matches!(self, SendFailure::NotConnected)
    }
}

/// Configuration that cannot be applied to an MQTT handler
#[derive(Debug, Error, PartialEq)]
pub enum ConfigRejected {
    #[error("Configuration is not an MQTT handler configuration")]
    NotMqtt,

    #[error("Invalid MQTT configuration: {0}")]
    Invalid(String),
}

/// Failure to serialize a log entry into its wire form
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoded entry is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Failure to hand an entry to the shipping queue
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Shipping queue is full")]
    Full,

    #[error("Shipper has shut down")]
    Closed,
}

/// Crate-level error for callers that do not need the fine-grained types
#[derive(Debug, Error)]
pub enum ShipperError {
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send failure: {0}")]
    Send(#[from] SendFailure),

    #[error("Configuration rejected: {0}")]
    ConfigRejected(#[from] ConfigRejected),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),
}

/// Result type for shipper operations
pub type ShipperResult<T> = Result<T, ShipperError>;
