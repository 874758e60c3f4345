//! Thread-safe metrics collection
//!
//! Atomic counters for the connection, publish path and handler lifecycle.
//! The binary logs a snapshot at shutdown.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<ShipperMetrics> = Lazy::new(ShipperMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static ShipperMetrics {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct ShipperMetrics {
    // Connection metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_attempts: AtomicU64,

    // Publish path
    entries_published: AtomicU64,
    bytes_published: AtomicU64,
    publish_failures: AtomicU64,
    not_connected_rejections: AtomicU64,
    entries_dropped: AtomicU64,

    // Configuration
    configurations_applied: AtomicU64,
    configurations_rejected: AtomicU64,

    // Lifecycle
    handler_state: Mutex<String>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl ShipperMetrics {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            entries_published: AtomicU64::new(0),
            bytes_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            not_connected_rejections: AtomicU64::new(0),
            entries_dropped: AtomicU64::new(0),
            configurations_applied: AtomicU64::new(0),
            configurations_rejected: AtomicU64::new(0),
            handler_state: Mutex::new("inactive".to_string()),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    // Publish path
    pub fn entry_published(&self, bytes: usize) {
        self.entries_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_connected_rejection(&self) {
        self.not_connected_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_dropped(&self) {
        self.entries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Configuration
    pub fn configuration_applied(&self) {
        self.configurations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn configuration_rejected(&self) {
        self.configurations_rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle
    pub fn set_handler_state(&self, state: &str) {
        let mut current_state = self
            .handler_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current_state != state {
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
            *current_state = state.to_string();
        }
    }

    /// Get comprehensive metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let handler_state = self
            .handler_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        MetricsSnapshot {
            timestamp: now,
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            },
            publish: PublishMetrics {
                entries_published: self.entries_published.load(Ordering::Relaxed),
                bytes_published: self.bytes_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                not_connected_rejections: self.not_connected_rejections.load(Ordering::Relaxed),
                entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                handler_state,
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                configurations_applied: self.configurations_applied.load(Ordering::Relaxed),
                configurations_rejected: self.configurations_rejected.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
        }
    }
}

impl Default for ShipperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub mqtt: MqttMetrics,
    pub publish: PublishMetrics,
    pub lifecycle: LifecycleMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub entries_published: u64,
    pub bytes_published: u64,
    pub publish_failures: u64,
    pub not_connected_rejections: u64,
    pub entries_dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub handler_state: String,
    pub state_transitions: u64,
    pub configurations_applied: u64,
    pub configurations_rejected: u64,
    pub uptime_seconds: u64,
}

/// Get current timestamp in seconds since Unix epoch
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_metrics() {
        let metrics = ShipperMetrics::new();

        metrics.mqtt_connection_attempt();
        metrics.mqtt_connection_established();
        let snapshot = metrics.snapshot();
        assert!(snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.connection_attempts, 1);
        assert_eq!(snapshot.mqtt.connections_established, 1);

        metrics.mqtt_connection_lost();
        metrics.mqtt_reconnect_attempt();
        metrics.mqtt_connection_failed();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.reconnect_attempts, 1);
        assert_eq!(snapshot.mqtt.connection_failures, 1);
    }

    #[test]
    fn test_publish_metrics() {
        let metrics = ShipperMetrics::new();

        metrics.entry_published(120);
        metrics.entry_published(80);
        metrics.publish_failed();
        metrics.not_connected_rejection();
        metrics.entry_dropped();

        let publish = metrics.snapshot().publish;
        assert_eq!(publish.entries_published, 2);
        assert_eq!(publish.bytes_published, 200);
        assert_eq!(publish.publish_failures, 1);
        assert_eq!(publish.not_connected_rejections, 1);
        assert_eq!(publish.entries_dropped, 1);
    }

    #[test]
    fn test_state_transitions_only_count_changes() {
        let metrics = ShipperMetrics::new();

        metrics.set_handler_state("activating");
        metrics.set_handler_state("active");
        metrics.set_handler_state("active");

        let lifecycle = metrics.snapshot().lifecycle;
        assert_eq!(lifecycle.handler_state, "active");
        assert_eq!(lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ShipperMetrics::new();
        metrics.configuration_applied();
        metrics.configuration_rejected();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["lifecycle"]["configurations_applied"], 1);
        assert_eq!(json["lifecycle"]["configurations_rejected"], 1);
        assert_eq!(json["mqtt"]["connected"], false);
    }
}
