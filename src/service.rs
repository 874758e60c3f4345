//! Service host: queue entries and drive the handler/sender contracts
//!
//! Producers submit entries through a [`ShipperHandle`]. A single worker owns
//! the queue receiver, activates the handler, keeps one sender alive and
//! replaces it whenever a send reports the session unusable. Failed
//! deliveries are retried; entries still queued at shutdown are drained
//! within a deadline.

use crate::config::BufferSection;
use crate::entry::LogEntry;
use crate::error::{SendFailure, SubmitError};
use crate::handler::MqttLogHandler;
use crate::observability::metrics;
use crate::sender::MqttSender;
use crate::transport::mqtt::ReconnectConfig;
use crate::transport::TransportFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Entry as held by the queue
pub type QueuedEntry = Box<dyn LogEntry>;

/// Producer side of the shipping queue
#[derive(Clone)]
pub struct ShipperHandle {
    sender: mpsc::Sender<QueuedEntry>,
}

impl std::fmt::Debug for ShipperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShipperHandle")
            .field("available", &self.sender.capacity())
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl ShipperHandle {
    /// Queue an entry, waiting for room when the queue is full
    pub async fn submit<E: LogEntry + 'static>(&self, entry: E) -> Result<(), SubmitError> {
        self.sender
            .send(Box::new(entry))
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Queue an entry without waiting
    pub fn try_submit<E: LogEntry + 'static>(&self, entry: E) -> Result<(), SubmitError> {
        self.sender
            .try_send(Box::new(entry))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::Full,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })
    }

    /// Free slots left in the queue
    pub fn available(&self) -> usize {
        self.sender.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Counts reported when the worker stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipperReport {
    /// Entries published before shutdown was requested
    pub delivered: u64,
    /// Entries given up on after exhausting their delivery attempts
    pub dropped: u64,
    /// Entries published while draining
    pub drained: u64,
    /// Entries still queued when the drain deadline passed
    pub abandoned: u64,
}

/// Delivery worker owning the queue receiver
pub struct LogShipper<F: TransportFactory> {
    handler: Arc<MqttLogHandler<F>>,
    receiver: mpsc::Receiver<QueuedEntry>,
    buffer: BufferSection,
    reconnect: ReconnectConfig,
    sender: Option<MqttSender<F::Transport>>,
}

impl<F: TransportFactory> LogShipper<F> {
    /// Create the worker and the handle producers submit through
    pub fn new(
        handler: Arc<MqttLogHandler<F>>,
        buffer: &BufferSection,
        reconnect: ReconnectConfig,
    ) -> (Self, ShipperHandle) {
        let (tx, rx) = mpsc::channel(buffer.capacity.max(1));
        let shipper = Self {
            handler,
            receiver: rx,
            buffer: buffer.clone(),
            reconnect,
            sender: None,
        };
        (shipper, ShipperHandle { sender: tx })
    }

    pub fn handler(&self) -> &Arc<MqttLogHandler<F>> {
        &self.handler
    }

    /// Deliver entries until shutdown is signalled or every handle is gone
    ///
    /// Always drains and deactivates the handler before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ShipperReport {
        let mut report = ShipperReport::default();

        match self.handler.activate().await {
            Ok(()) => info!(client_id = %self.handler.client_id(), "Log shipper started"),
            Err(e) => warn!(error = %e, "Initial activation failed, will retry on first entry"),
        }

        let mut interrupted: Option<QueuedEntry> = None;

        loop {
            let entry = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested, draining queue");
                    break;
                }
                entry = self.receiver.recv() => match entry {
                    Some(entry) => entry,
                    None => {
                        info!("All producers gone, draining queue");
                        break;
                    }
                },
            };

            tokio::select! {
                biased;

                delivered = self.deliver(entry.as_ref()) => {
                    if delivered {
                        report.delivered += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested during delivery, draining queue");
                    interrupted = Some(entry);
                    break;
                }
            }
        }

        self.drain(interrupted, &mut report).await;

        if let Some(sender) = self.sender.take() {
            sender.dispose().await;
        }
        self.handler.deactivate().await;

        info!(
            delivered = report.delivered,
            drained = report.drained,
            dropped = report.dropped,
            abandoned = report.abandoned,
            "Log shipper stopped"
        );
        report
    }

    async fn drain(&mut self, first: Option<QueuedEntry>, report: &mut ShipperReport) {
        self.receiver.close();
        let deadline = Instant::now() + self.buffer.drain_timeout();
        let mut next = first;

        loop {
            let entry = match next.take() {
                Some(entry) => entry,
                None => match self.receiver.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => return,
                },
            };

            match tokio::time::timeout_at(deadline, self.deliver(entry.as_ref())).await {
                Ok(true) => report.drained += 1,
                Ok(false) => report.dropped += 1,
                Err(_) => {
                    let mut abandoned = 1;
                    while self.receiver.try_recv().is_ok() {
                        abandoned += 1;
                    }
                    for _ in 0..abandoned {
                        metrics().entry_dropped();
                    }
                    warn!(abandoned, "Drain deadline passed with entries still queued");
                    report.abandoned += abandoned;
                    return;
                }
            }
        }
    }

    /// Publish one entry, retrying up to the configured attempt count
    async fn deliver(&mut self, entry: &dyn LogEntry) -> bool {
        let max_attempts = self.buffer.max_delivery_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.apply_pending_reconnect().await;

            let sender = match self.sender.take() {
                Some(sender) => sender,
                None => self.acquire_sender().await,
            };

            match sender.try_send(entry).await {
                Ok(delivery) => {
                    debug!(topic = %delivery.topic, qos = delivery.qos.level(), "Entry delivered");
                    if delivery.session_usable {
                        self.sender = Some(sender);
                    } else {
                        debug!("Session marked unusable, replacing sender");
                        sender.dispose().await;
                    }
                    return true;
                }
                Err(failure) => {
                    sender.dispose().await;

                    if is_permanent(&failure) {
                        error!(origin = %entry.origin(), error = %failure, "Entry cannot be delivered");
                        metrics().entry_dropped();
                        return false;
                    }

                    warn!(
                        attempt,
                        max_attempts,
                        origin = %entry.origin(),
                        error = %failure,
                        "Delivery attempt failed"
                    );
                }
            }
        }

        error!(origin = %entry.origin(), max_attempts, "Giving up on entry");
        metrics().entry_dropped();
        false
    }

    /// Retire the current session when a new address is waiting
    async fn apply_pending_reconnect(&mut self) {
        if !self.handler.reconnect_pending() {
            return;
        }

        match &self.sender {
            Some(sender) => {
                if !sender.is_marked_disconnected() {
                    info!("New broker address pending, retiring current session");
                    sender.mark_disconnected();
                }
            }
            None => {
                if self.handler.connection_state().is_some() {
                    info!("New broker address pending, deactivating handler");
                    self.handler.deactivate().await;
                }
            }
        }
    }

    /// Wait until the handler can hand out a sender
    ///
    /// Activates an inactive handler, and replaces a connection whose
    /// supervisor has given up. Waits between rounds with jittered backoff.
    async fn acquire_sender(&self) -> MqttSender<F::Transport> {
        let mut round: u32 = 0;

        loop {
            if let Some(sender) = self.handler.create_sender() {
                if round > 0 {
                    info!(rounds = round, "Connection available again");
                }
                return sender;
            }

            match self.handler.connection_state() {
                None => {
                    if let Err(e) = self.handler.activate().await {
                        warn!(error = %e, round, "Activation failed");
                    } else {
                        continue;
                    }
                }
                Some(state) if state.is_terminal() => {
                    warn!(?state, "Connection gone, recreating it");
                    self.handler.deactivate().await;
                    continue;
                }
                Some(state) => {
                    debug!(?state, "Waiting for connection");
                }
            }

            round = round.saturating_add(1);
            tokio::time::sleep(Duration::from_millis(self.reconnect.jittered_delay(round))).await;
        }
    }
}

/// Failures a retry cannot fix
fn is_permanent(failure: &SendFailure) -> bool {
    matches!(
        failure,
        SendFailure::InvalidTarget { .. } | SendFailure::Encode(_)
    )
}

/// Resolves once the flag reads true or the signalling side is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow_and_update() {
        return;
    }
    while shutdown.changed().await.is_ok() {
        if *shutdown.borrow_and_update() {
            return;
        }
    }
}
