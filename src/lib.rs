//! MQTT Log Shipper
//!
//! Publishes structured log entries to an MQTT broker.
//!
//! # Overview
//!
//! The crate is built around three pieces:
//! - a connection supervisor that owns one outbound MQTT v5 connection and
//!   reconnects with jittered exponential backoff
//! - a publish gate ([`MqttSender`]) that encodes one entry at a time and
//!   reports per-message outcomes plus a session-liveness signal
//! - a configuration binding ([`MqttLogHandler`]) that applies hot-reloaded
//!   configuration, updating the live QoS in place
//!
//! [`LogShipper`] plays the host role on top of these: a bounded queue, a
//! delivery worker with retries, and a drain on shutdown.
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_log_shipper::testing::MockTransportFactory;
//! use mqtt_log_shipper::{LogLevel, MqttLogHandler, ShipperConfig, StructuredLogEntry};
//!
//! let config = ShipperConfig::from_toml(
//!     r#"
//!     [mqtt]
//!     connection_string = "broker://test:1883"
//!     qos = 1
//!     "#,
//! )
//! .unwrap();
//!
//! let handler = MqttLogHandler::new(MockTransportFactory::new(), &config);
//!
//! tokio_test::block_on(async {
//!     handler.activate().await.unwrap();
//!     let sender = handler.create_sender().unwrap();
//!
//!     let entry = StructuredLogEntry::new("svc-A", LogLevel::Info, "started");
//!     let delivery = sender.try_send(&entry).await.unwrap();
//!     assert_eq!(delivery.topic, "logs/svc-A");
//!
//!     sender.dispose().await;
//!     handler.deactivate().await;
//! });
//! ```

pub mod buffer_pool;
pub mod config;
pub mod entry;
pub mod error;
pub mod handler;
pub mod observability;
pub mod qos;
pub mod sender;
pub mod service;
pub mod testing;
pub mod transport;

pub use config::*;
pub use entry::{LogEntry, LogLevel, RawLogEntry, StructuredLogEntry};
pub use error::{
    ConfigRejected, ConnectError, EncodeError, SendFailure, ShipperError, ShipperResult,
    SubmitError,
};
pub use handler::{Applied, HandlerState, MqttLogHandler};
pub use qos::QualityOfService;
pub use sender::{Delivery, MqttSender};
pub use service::{LogShipper, ShipperHandle, ShipperReport};
pub use transport::mqtt::MqttClient;
pub use transport::{MqttTransportFactory, Transport, TransportFactory};
