//! Matching published messages to their broker acknowledgements
//!
//! rumqttc assigns packet identifiers inside the event loop, after
//! `AsyncClient::publish` has returned. Requests leave the loop in the order
//! they were queued, so waiters are registered in queue order and paired with
//! `Outgoing::Publish(pkid)` events first-in first-out. Once the packet id is
//! known, the waiter is completed by the matching PUBACK (QoS 1) or PUBCOMP
//! (QoS 2). QoS 0 publishes complete as soon as they are written.

use crate::qos::QualityOfService;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a publish was not confirmed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection lost before acknowledgement: {0}")]
    ConnectionLost(String),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("publish withdrawn before it was sent")]
    Withdrawn,
}

pub type DeliveryResult = Result<(), DeliveryError>;

struct Waiter {
    qos: QualityOfService,
    tx: oneshot::Sender<DeliveryResult>,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<Waiter>,
    in_flight: HashMap<u16, oneshot::Sender<DeliveryResult>>,
}

/// Tracks publishes between enqueue and acknowledgement
#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for AckTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("AckTracker")
            .field("pending", &inner.pending.len())
            .field("in_flight", &inner.in_flight.len())
            .finish()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for the next publish about to be queued
    ///
    /// Callers must register and enqueue under the same lock so that the
    /// registration order matches the order requests reach the event loop.
    pub fn register(&self, qos: QualityOfService) -> oneshot::Receiver<DeliveryResult> {
        let (tx, rx) = oneshot::channel();
        self.lock().pending.push_back(Waiter { qos, tx });
        rx
    }

    /// Undo the most recent registration after the enqueue itself failed
    pub fn cancel_last(&self) {
        if let Some(waiter) = self.lock().pending.pop_back() {
            let _ = waiter.tx.send(Err(DeliveryError::Withdrawn));
        }
    }

    /// The event loop wrote a PUBLISH with this packet id
    pub fn on_outgoing_publish(&self, pkid: u16) {
        let mut inner = self.lock();
        let Some(waiter) = inner.pending.pop_front() else {
            return;
        };

        if waiter.qos == QualityOfService::AtMostOnce {
            let _ = waiter.tx.send(Ok(()));
        } else {
            inner.in_flight.insert(pkid, waiter.tx);
        }
    }

    /// PUBACK or PUBCOMP arrived for this packet id
    pub fn on_acknowledged(&self, pkid: u16) {
        if let Some(tx) = self.lock().in_flight.remove(&pkid) {
            let _ = tx.send(Ok(()));
        }
    }

    /// The broker answered with a failure reason code
    pub fn on_rejected(&self, pkid: u16, reason: &str) {
        if let Some(tx) = self.lock().in_flight.remove(&pkid) {
            let _ = tx.send(Err(DeliveryError::Rejected(reason.to_string())));
        }
    }

    /// Fail every outstanding waiter; called when the connection drops
    pub fn fail_all(&self, reason: &str) {
        let mut inner = self.lock();
        for waiter in inner.pending.drain(..) {
            let _ = waiter
                .tx
                .send(Err(DeliveryError::ConnectionLost(reason.to_string())));
        }
        for (_, tx) in inner.in_flight.drain() {
            let _ = tx.send(Err(DeliveryError::ConnectionLost(reason.to_string())));
        }
    }

    /// Number of publishes not yet resolved
    pub fn outstanding(&self) -> usize {
        let inner = self.lock();
        inner.pending.len() + inner.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_completes_on_send() {
        let tracker = AckTracker::new();
        let rx = tracker.register(QualityOfService::AtMostOnce);

        tracker.on_outgoing_publish(0);
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_qos1_waits_for_puback() {
        let tracker = AckTracker::new();
        let mut rx = tracker.register(QualityOfService::AtLeastOnce);

        tracker.on_outgoing_publish(7);
        assert!(rx.try_recv().is_err(), "not acknowledged yet");
        assert_eq!(tracker.outstanding(), 1);

        tracker.on_acknowledged(7);
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_waiters_pair_in_fifo_order() {
        let tracker = AckTracker::new();
        let first = tracker.register(QualityOfService::AtLeastOnce);
        let second = tracker.register(QualityOfService::ExactlyOnce);

        tracker.on_outgoing_publish(1);
        tracker.on_outgoing_publish(2);

        tracker.on_rejected(2, "QuotaExceeded");
        tracker.on_acknowledged(1);

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(
            second.await.unwrap(),
            Err(DeliveryError::Rejected("QuotaExceeded".to_string()))
        );
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everything() {
        let tracker = AckTracker::new();
        let queued = tracker.register(QualityOfService::AtLeastOnce);
        let sent = tracker.register(QualityOfService::AtLeastOnce);
        tracker.on_outgoing_publish(3);

        tracker.fail_all("connection reset");

        assert!(matches!(
            queued.await.unwrap(),
            Err(DeliveryError::ConnectionLost(_))
        ));
        assert!(matches!(
            sent.await.unwrap(),
            Err(DeliveryError::ConnectionLost(_))
        ));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_last_withdraws_newest() {
        let tracker = AckTracker::new();
        let _kept = tracker.register(QualityOfService::AtLeastOnce);
        let withdrawn = tracker.register(QualityOfService::AtLeastOnce);

        tracker.cancel_last();
        assert_eq!(withdrawn.await.unwrap(), Err(DeliveryError::Withdrawn));
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let tracker = AckTracker::new();
        tracker.on_acknowledged(42);
        tracker.on_outgoing_publish(1);
        assert_eq!(tracker.outstanding(), 0);
    }
}
