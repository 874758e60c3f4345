//! Publish gate: one entry in, one publish out
//!
//! A sender is bound to the connection of the activation that created it.
//! The host keeps it for as long as sends report a usable session and
//! replaces it otherwise.

use crate::buffer_pool::BufferPool;
use crate::entry::LogEntry;
use crate::error::{EncodeError, SendFailure};
use crate::mqtt_span;
use crate::observability::metrics;
use crate::qos::{QualityOfService, SharedQos};
use crate::transport::mqtt::{MqttError, SharedTopics};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

/// Fixed header, topic length prefix, packet id and property length of a
/// v5 PUBLISH without properties
const PUBLISH_OVERHEAD: usize = 16;

/// Outcome of a successful `try_send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub qos: QualityOfService,
    /// False once the sender has been marked disconnected
    pub session_usable: bool,
}

/// Publish channel handed to the host
pub struct MqttSender<T: Transport + 'static> {
    transport: Arc<T>,
    qos: Arc<SharedQos>,
    topics: Arc<SharedTopics>,
    pool: Arc<BufferPool>,
    max_packet_size: usize,
    disconnected: AtomicBool,
    disposed: AtomicBool,
}

impl<T: Transport + 'static> std::fmt::Debug for MqttSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSender")
            .field("topic_prefix", &self.topics.load().prefix())
            .field("qos", &self.qos.load())
            .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Transport + 'static> MqttSender<T> {
    pub fn new(
        transport: Arc<T>,
        qos: Arc<SharedQos>,
        topics: Arc<SharedTopics>,
        pool: Arc<BufferPool>,
        max_packet_size: usize,
    ) -> Self {
        Self {
            transport,
            qos,
            topics,
            pool,
            max_packet_size,
            disconnected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Publish one entry at the current QoS
    ///
    /// Fails fast with `NotConnected` without touching the transport when the
    /// connection is down. Otherwise waits for the delivery confirmation the
    /// QoS level calls for.
    pub async fn try_send(&self, entry: &dyn LogEntry) -> Result<Delivery, SendFailure> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SendFailure::Disposed);
        }

        if !self.transport.is_connected() {
            metrics().not_connected_rejection();
            return Err(SendFailure::NotConnected);
        }

        let origin = entry.origin();
        let topic = self
            .topics
            .build_log_topic(origin)
            .map_err(|reason| SendFailure::InvalidTarget {
                origin: origin.to_string(),
                reason,
            })?;

        // Read once so the whole publish uses a single level
        let qos = self.qos.load();

        let mut buf = self.pool.acquire();
        let encoded = entry.encode(&mut buf);
        let payload = buf.split().freeze();
        self.pool.release(buf);
        encoded?;

        let size = payload.len() + topic.len() + PUBLISH_OVERHEAD;
        if size > self.max_packet_size {
            return Err(EncodeError::TooLarge {
                size,
                limit: self.max_packet_size,
            }
            .into());
        }

        let bytes = payload.len();
        let span = mqtt_span!("publish", topic = %topic, qos = qos.level(), bytes = bytes);
        let result = self
            .transport
            .publish(&topic, qos, false, payload)
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                metrics().entry_published(bytes);
                Ok(Delivery {
                    topic,
                    qos,
                    session_usable: !self.disconnected.load(Ordering::SeqCst),
                })
            }
            Err(MqttError::NotConnected { state }) => {
                // Connection dropped between the liveness check and the publish
                debug!(?state, "Connection went away before publish");
                metrics().not_connected_rejection();
                Err(SendFailure::NotConnected)
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Publish failed");
                metrics().publish_failed();
                Err(SendFailure::Publish(e))
            }
        }
    }

    /// One-way latch: every later send reports the session unusable
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Liveness of the underlying transport, ignoring the latch
    pub fn is_actually_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// QoS the next publish will use
    pub fn current_qos(&self) -> QualityOfService {
        self.qos.load()
    }

    /// Disconnect and release the bound connection; later calls are no-ops
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnected.store(true, Ordering::SeqCst);

        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Error while disposing sender connection");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<T: Transport + 'static> Drop for MqttSender<T> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.transport.request_shutdown();
        }
    }
}
