//! MQTT client implementation for log publishing
//!
//! This module keeps pure decision logic apart from I/O so that most of the
//! connection behaviour can be tested without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state, options and topic construction
//! - [`event_router`] - Pure classification of rumqttc events and errors
//! - [`health_monitor`] - Pure reconnection decisions and state transitions
//! - [`ack_tracker`] - Matching publishes to their broker acknowledgements
//! - [`client`] - The connection supervisor, all I/O lives here
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_log_shipper::config::MqttSection;
//! use mqtt_log_shipper::qos::QualityOfService;
//! use mqtt_log_shipper::transport::mqtt::{MqttClient, ReconnectConfig};
//! use mqtt_log_shipper::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection::new("mqtt://localhost:1883", QualityOfService::AtLeastOnce);
//!
//! let client = MqttClient::new("log-shipper-host-01", config, ReconnectConfig::default())?;
//! client.connect().await?;
//! client
//!     .publish("logs/host-01", QualityOfService::AtLeastOnce, false, "hello".into())
//!     .await?;
//! client.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod client;
pub mod connection;
pub mod event_router;
pub mod health_monitor;

// Re-export public types for convenience
pub use ack_tracker::{AckTracker, DeliveryError};
pub use client::MqttClient;
pub use connection::{
    parse_connection_string, BrokerAddress, ConnectionState, MqttError, ReconnectConfig,
    SharedTopics, TopicBuilder,
};
pub use event_router::{ConnectionFailure, EventRoute, EventRouter};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
