//! Transport layer for log publishing
//!
//! This module provides the transport abstraction used by the handler and its
//! senders, and the MQTT implementation of it.

use crate::config::MqttSection;
use crate::qos::QualityOfService;
use bytes::Bytes;
use std::sync::Arc;

pub mod mqtt;

use mqtt::{ConnectionState, MqttError, ReconnectConfig};

/// Transport trait for publishing log entries
///
/// One transport instance owns one broker connection. It is shared between
/// the handler and the senders it creates, so every operation takes `&self`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect and wait until the broker acknowledges the session
    async fn connect(&self) -> Result<(), MqttError>;

    /// Gracefully disconnect and release the connection
    ///
    /// Calling this on a transport that is already closed is a no-op.
    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Signal the connection to close without waiting for it
    ///
    /// Used from `Drop` paths where awaiting is impossible.
    fn request_shutdown(&self);

    /// Publish one payload and wait for the delivery confirmation that the
    /// QoS level calls for
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;
}

/// Builds the transport for one activation
pub trait TransportFactory: Send + Sync {
    type Transport: Transport + 'static;

    fn create(
        &self,
        client_id: &str,
        config: &MqttSection,
        reconnect: &ReconnectConfig,
    ) -> Result<Arc<Self::Transport>, MqttError>;
}

/// Factory producing rumqttc-backed clients
#[derive(Debug, Clone, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    type Transport = mqtt::MqttClient;

    fn create(
        &self,
        client_id: &str,
        config: &MqttSection,
        reconnect: &ReconnectConfig,
    ) -> Result<Arc<Self::Transport>, MqttError> {
        Ok(Arc::new(mqtt::MqttClient::new(
            client_id,
            config.clone(),
            reconnect.clone(),
        )?))
    }
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
