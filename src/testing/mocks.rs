//! Mock implementations for testing
//!
//! Provides a mock Transport and TransportFactory so the handler, sender and
//! service can be exercised without a broker.

use crate::config::MqttSection;
use crate::qos::QualityOfService;
use crate::transport::mqtt::{parse_connection_string, ConnectionState, MqttError, ReconnectConfig};
use crate::transport::{Transport, TransportFactory};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One publish recorded by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QualityOfService,
    pub retain: bool,
    pub payload: Bytes,
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    accept: bool,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_publish: AtomicBool,
    failures_remaining: AtomicUsize,
    publish_delay: Mutex<Option<Duration>>,
    published: Mutex<Vec<PublishedMessage>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    shutdown_requests: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::with_acceptance(true)
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose broker refuses every connection
    pub fn refusing() -> Self {
        Self::with_acceptance(false)
    }

    fn with_acceptance(accept: bool) -> Self {
        Self {
            accept,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            failures_remaining: AtomicUsize::new(0),
            publish_delay: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            shutdown_requests: AtomicUsize::new(0),
        }
    }

    /// Make every publish fail until reset
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before recording it
    pub fn set_publish_delay(&self, delay: Duration) {
        *self
            .publish_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Drop the connection as if the network failed
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Bring a dropped connection back
    pub fn simulate_reconnect(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_requests(&self) -> usize {
        self.shutdown_requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        if self.fail_publish.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), MqttError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Client already closed".to_string(),
            ));
        }
        if !self.accept {
            return Err(MqttError::ConnectionRefused("NotAuthorized".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn request_shutdown(&self) {
        self.shutdown_requests.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: self.connection_state(),
            });
        }
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self
            .publish_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(MqttError::PublishFailed("Mock publish failure".into()));
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                qos,
                retain,
                payload,
            });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("Mock connection down".to_string())
        }
    }
}

/// Factory handing out mock transports and keeping them for inspection
#[derive(Debug)]
pub struct MockTransportFactory {
    accept: AtomicBool,
    fail_publish: AtomicBool,
    created: Mutex<Vec<Arc<MockTransport>>>,
    client_ids: Mutex<Vec<String>>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            accept: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            client_ids: Mutex::new(Vec::new()),
        }
    }

    /// A factory whose transports are refused by the broker
    pub fn refusing() -> Self {
        let factory = Self::new();
        factory.set_accept(false);
        factory
    }

    /// Whether transports created from now on accept connections
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Whether transports created from now on fail every publish
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.client_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(
        &self,
        client_id: &str,
        config: &MqttSection,
        _reconnect: &ReconnectConfig,
    ) -> Result<Arc<MockTransport>, MqttError> {
        // Same address check the real factory applies
        parse_connection_string(&config.connection_string)?;

        let transport = Arc::new(MockTransport::with_acceptance(
            self.accept.load(Ordering::SeqCst),
        ));
        transport.set_fail_publish(self.fail_publish.load(Ordering::SeqCst));
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transport.clone());
        self.client_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client_id.to_string());
        Ok(transport)
    }
}
