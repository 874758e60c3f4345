//! Impure I/O operations for MQTT client
//!
//! This module handles all impure I/O operations including network communication,
//! async coordination, and integration with the rumqttc client. Decisions are
//! delegated to the pure modules next to it.

use super::ack_tracker::{AckTracker, DeliveryError};
use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::event_router::{ConnectionFailure, EventRoute, EventRouter};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use crate::config::MqttSection;
use crate::observability::metrics;
use crate::qos::QualityOfService;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect()` waits for the DISCONNECT packet to be written
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// MQTT connection owned by one handler activation
///
/// `connect()` spawns a supervisor task that drives the rumqttc event loop,
/// matches acknowledgements to publishes and re-establishes the connection
/// with backoff after it has been up once.
pub struct MqttClient {
    client_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: std::sync::Mutex<Option<EventLoop>>,
    acks: Arc<AckTracker>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("broker", &self.config.connection_string)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl MqttClient {
    /// Build the client without touching the network
    pub fn new(
        client_id: &str,
        config: MqttSection,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(client_id, &config)?;
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();

        Ok(MqttClient {
            client_id: client_id.to_string(),
            config,
            reconnect_config,
            client: Arc::new(Mutex::new(client)),
            event_loop: std::sync::Mutex::new(Some(event_loop)),
            acks: Arc::new(AckTracker::new()),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            closing: Arc::new(AtomicBool::new(false)),
            supervisor: std::sync::Mutex::new(None),
        })
    }

    /// Helper method to create new MQTT connection and event loop
    /// Used for initial connection and reconnection attempts
    fn create_connection(
        client_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    ///
    /// Before the first ConnAck the supervisor never reconnects, so a
    /// permanent failure here can only be a refused CONNECT.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionRefused(reason.clone()));
                    }
                    ConnectionState::Closed => {
                        return Err(MqttError::ConnectionFailedStr(
                            "Closed while connecting".to_string(),
                        ));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnAckTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                true
            }
        }
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn mark_closed(&self, reason: &str) {
        let _ = self.state_tx.send(ConnectionState::Closed);
        self.acks.fail_all(reason);
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publishes waiting for a broker acknowledgement
    pub fn outstanding_publishes(&self) -> usize {
        self.acks.outstanding()
    }
}

#[async_trait]
impl Transport for MqttClient {
    /// Connect to the broker and wait for the ConnAck
    ///
    /// The initial attempt is not retried here. Once connected, the
    /// supervisor reconnects on its own according to the reconnect policy.
    async fn connect(&self) -> Result<(), MqttError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailedStr(
                "Client already closed".to_string(),
            ));
        }

        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MqttError::AlreadyStarted)?;

        metrics().mqtt_connection_attempt();
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let supervisor = Supervisor {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            acks: self.acks.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            closing: self.closing.clone(),
            ever_connected: false,
            reconnect_attempts: 0,
            disconnected_since: None,
        };
        let handle = tokio::spawn(supervisor.run(event_loop));
        *self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let timeout = HealthMonitor::calculate_connection_timeout(self.config.connect_timeout());
        let result =
            Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await;

        if let Err(e) = &result {
            warn!(client_id = %self.client_id, error = %e, "MQTT connection attempt failed");
            metrics().mqtt_connection_failed();
            self.request_shutdown();
        }
        result
    }

    /// Disconnect from the broker
    ///
    /// While connected, queues a DISCONNECT and gives the supervisor a short
    /// grace period to write it. Otherwise the supervisor is signalled
    /// straight away, which also interrupts a pending reconnection delay.
    /// Idempotent.
    async fn disconnect(&self) -> Result<(), MqttError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "Disconnect on closed client ignored");
            return Ok(());
        }

        let Some(mut handle) = self.take_supervisor() else {
            self.mark_closed("Client disconnected");
            return Ok(());
        };

        let mut disconnect_queued = false;
        if HealthMonitor::can_publish(&self.connection_state()) {
            let client = self.client.lock().await;
            match client.try_disconnect() {
                Ok(()) => disconnect_queued = true,
                Err(e) => debug!("Could not queue DISCONNECT: {}", e),
            }
        }
        if !disconnect_queued {
            let _ = self.shutdown_tx.send(true);
        }

        match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
            Ok(Ok(())) => {
                info!("Connection supervisor shut down gracefully");
            }
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!("Connection supervisor ended with error: {}", e);
            }
            Err(_) => {
                warn!("Connection supervisor didn't shut down gracefully, forcing abort");
                let _ = self.shutdown_tx.send(true);
                handle.abort();
            }
            _ => {}
        }

        let _ = self.shutdown_tx.send(true);
        self.mark_closed("Client disconnected");
        metrics().mqtt_connection_lost();
        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    fn request_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.mark_closed("Client shut down");
    }

    /// Publish and wait for the acknowledgement the QoS level calls for
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        // Registration and enqueue happen under the client lock so waiters
        // line up with the order requests reach the event loop
        let receiver = {
            let client = self.client.lock().await;
            let receiver = self.acks.register(qos);
            if let Err(e) = client.try_publish(topic.to_string(), qos.to_mqtt(), retain, payload) {
                self.acks.cancel_last();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            receiver
        };

        let timeout = self.config.publish_timeout();
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(MqttError::Delivery(e)),
            Ok(Err(_)) => Err(MqttError::Delivery(DeliveryError::ConnectionLost(
                "acknowledgement channel dropped".to_string(),
            ))),
            Err(_) => Err(MqttError::PublishTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state_rx.borrow())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Signal shutdown to background tasks if they're still running
        let _ = self.shutdown_tx.send(true);

        // Abort the supervisor task if it's still running
        if let Some(handle) = self.take_supervisor() {
            handle.abort();
        }

        // Drop can't await; callers wanting a clean DISCONNECT use disconnect()
    }
}

/// State owned by the spawned supervisor task
struct Supervisor {
    client_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    acks: Arc<AckTracker>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    ever_connected: bool,
    reconnect_attempts: u32,
    disconnected_since: Option<Instant>,
}

impl Supervisor {
    async fn run(mut self, event_loop: EventLoop) {
        info!(client_id = %self.client_id, "Starting MQTT event loop with reconnection supervisor");
        let mut current_event_loop = event_loop;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                // Check for shutdown signal first (higher priority)
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event_result = current_event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = EventRouter::route_mqtt_event(&event);
                            self.process_event_route(route, &mut current_event_loop).await
                        }
                        Err(e) => self.handle_event_loop_error(e, &mut current_event_loop).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        self.acks.fail_all("Connection supervisor stopped");
        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        if next != current {
            HealthMonitor::log_state_transition(&current, &next);
        }
        let _ = self.state_tx.send(next);
    }

    /// Returns true to continue loop, false to break
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.ever_connected = true;
                self.reconnect_attempts = 0;
                self.disconnected_since = None;
                metrics().mqtt_connection_established();
                true
            }
            EventRoute::Disconnected(reason) => {
                self.acks.fail_all(&reason);
                metrics().mqtt_connection_lost();
                self.transition(ConnectionEvent::DisconnectedByBroker(reason));
                self.reconnect(current_event_loop).await
            }
            EventRoute::PublishSent(pkid) => {
                self.acks.on_outgoing_publish(pkid);
                true
            }
            EventRoute::PublishAcknowledged(pkid) => {
                self.acks.on_acknowledged(pkid);
                true
            }
            EventRoute::PublishRejected { pkid, reason } => {
                warn!(pkid = pkid, reason = %reason, "Broker rejected publish");
                self.acks.on_rejected(pkid, &reason);
                true
            }
            EventRoute::DisconnectSent => {
                self.transition(ConnectionEvent::ClosedByClient);
                false
            }
            EventRoute::InfrastructureEvent(event_str) => {
                tracing::debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true to continue loop (after reconnection), false to break
    async fn handle_event_loop_error(
        &mut self,
        error: rumqttc::v5::ConnectionError,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            self.transition(ConnectionEvent::ClosedByClient);
            return false;
        }

        metrics().mqtt_connection_lost();
        match EventRouter::classify_connection_error(&error) {
            ConnectionFailure::Closed => {
                self.acks.fail_all("Client handle closed");
                self.transition(ConnectionEvent::ClosedByClient);
                false
            }
            ConnectionFailure::Refused(code) => {
                error!(client_id = %self.client_id, code = %code, "Broker refused connection");
                self.acks.fail_all("Connection refused");
                self.transition(ConnectionEvent::PermanentFailure(format!(
                    "Connection refused: {code}"
                )));
                false
            }
            ConnectionFailure::Transient(reason) => {
                error!(client_id = %self.client_id, "MQTT event loop error: {}", reason);
                self.acks.fail_all(&reason);
                self.transition(ConnectionEvent::NetworkError(reason));

                // connect() reports a failed first attempt to its caller
                if !self.ever_connected {
                    return false;
                }
                self.reconnect(current_event_loop).await
            }
        }
    }

    async fn reconnect(&mut self, current_event_loop: &mut EventLoop) -> bool {
        let disconnected_since = *self.disconnected_since.get_or_insert_with(Instant::now);
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            disconnected_since.elapsed(),
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                metrics().mqtt_reconnect_attempt();

                let delay_ms = self
                    .reconnect_config
                    .apply_jitter(delay_ms, rand::rng().random::<f64>());
                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !MqttClient::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                self.apply_new_connection(current_event_loop).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
            ReconnectionDecision::AbortMaxDurationExceeded => {
                let reason = format!(
                    "Disconnected for {}s, giving up",
                    disconnected_since.elapsed().as_secs()
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    /// Replace client and event loop so the next poll opens a fresh session
    async fn apply_new_connection(&self, current_event_loop: &mut EventLoop) -> bool {
        match MqttClient::create_connection(&self.client_id, &self.config) {
            Ok((new_client, new_event_loop)) => {
                *current_event_loop = new_event_loop;

                // Update the shared client so publishes go to the new connection
                let mut client_guard = self.client.lock().await;
                *client_guard = new_client;
                debug!("Updated shared client reference for reconnection");
                true
            }
            Err(e) => {
                // Options were valid once; this only fails if they stop being so
                error!("Failed to create new connection: {}", e);
                self.transition(ConnectionEvent::PermanentFailure(e.to_string()));
                false
            }
        }
    }
}
