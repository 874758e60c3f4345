//! MQTT log handler: the host-facing lifecycle
//!
//! The host drives four entry points: `activate`, `create_sender`,
//! `apply_configuration` and `deactivate`. A handler owns at most one live
//! connection at a time; every sender it creates shares that connection and
//! reads the QoS from a cell that `apply_configuration` updates in place.

use crate::buffer_pool::BufferPool;
use crate::config::{HandlerConfiguration, MqttSection, ShipperConfig, ShipperSection};
use crate::error::{ConfigRejected, ConnectError};
use crate::lifecycle_span;
use crate::observability::metrics;
use crate::qos::{QualityOfService, SharedQos};
use crate::sender::MqttSender;
use crate::transport::mqtt::{ConnectionState, ReconnectConfig, SharedTopics, TopicBuilder};
use crate::transport::{MqttTransportFactory, Transport, TransportFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{error, info, warn, Instrument};

/// Observable handler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Inactive,
    Activating,
    Active { connected: bool },
    Deactivating,
}

impl HandlerState {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerState::Inactive => "inactive",
            HandlerState::Activating => "activating",
            HandlerState::Active { connected: true } => "active",
            HandlerState::Active { connected: false } => "active_disconnected",
            HandlerState::Deactivating => "deactivating",
        }
    }
}

/// What `apply_configuration` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// A live connection exists and its senders now publish at the new QoS
    pub live_qos_updated: bool,
    /// Senders now derive topics from the new prefix
    pub topic_prefix_updated: bool,
    /// Connection-level settings changed; they apply on the next activation
    pub address_change_pending: bool,
}

enum Lifecycle<T> {
    Inactive,
    Activating { cancelled: bool },
    Active { transport: Arc<T>, config: MqttSection },
    Deactivating,
}

/// Handler binding one MQTT connection to the host
pub struct MqttLogHandler<F: TransportFactory> {
    factory: F,
    shipper: ShipperSection,
    reconnect: ReconnectConfig,
    config: RwLock<MqttSection>,
    lifecycle: Mutex<Lifecycle<F::Transport>>,
    qos: Arc<SharedQos>,
    topics: Arc<SharedTopics>,
    pool: Arc<BufferPool>,
    reconnect_pending: AtomicBool,
}

impl MqttLogHandler<MqttTransportFactory> {
    /// Handler backed by real rumqttc connections
    pub fn from_config(config: &ShipperConfig) -> Self {
        Self::new(MqttTransportFactory, config)
    }
}

impl<F: TransportFactory> MqttLogHandler<F> {
    pub fn new(factory: F, config: &ShipperConfig) -> Self {
        Self {
            factory,
            shipper: config.shipper.clone(),
            reconnect: config.to_reconnect_config(),
            config: RwLock::new(config.mqtt.clone()),
            lifecycle: Mutex::new(Lifecycle::Inactive),
            qos: Arc::new(SharedQos::new(config.mqtt.qos)),
            topics: Arc::new(SharedTopics::new(TopicBuilder::new(&config.mqtt.topic_prefix))),
            pool: Arc::new(BufferPool::default()),
            reconnect_pending: AtomicBool::new(false),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle<F::Transport>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(
        guard: &mut MutexGuard<'_, Lifecycle<F::Transport>>,
        next: Lifecycle<F::Transport>,
    ) {
        **guard = next;
        metrics().set_handler_state(Self::state_of(guard).name());
    }

    fn state_of(lifecycle: &Lifecycle<F::Transport>) -> HandlerState {
        match lifecycle {
            Lifecycle::Inactive => HandlerState::Inactive,
            Lifecycle::Activating { .. } => HandlerState::Activating,
            Lifecycle::Active { transport, .. } => HandlerState::Active {
                connected: transport.is_connected(),
            },
            Lifecycle::Deactivating => HandlerState::Deactivating,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn client_id(&self) -> String {
        self.shipper.client_id()
    }

    /// Current handler state, with live connection status
    pub fn state(&self) -> HandlerState {
        Self::state_of(&self.lifecycle())
    }

    /// State of the live connection, None unless active
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match &*self.lifecycle() {
            Lifecycle::Active { transport, .. } => Some(transport.connection_state()),
            _ => None,
        }
    }

    /// An applied configuration is waiting for the next activation
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending.load(Ordering::SeqCst)
    }

    /// Stored MQTT configuration; the one the next activation will use
    pub fn configuration(&self) -> MqttSection {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// QoS new publishes are issued at
    pub fn qos(&self) -> QualityOfService {
        self.qos.load()
    }

    /// Establish the connection with the stored configuration
    ///
    /// On failure the half-built connection is torn down and the handler
    /// stays `Inactive` until the next call.
    pub async fn activate(&self) -> Result<(), ConnectError> {
        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Inactive) {
                return Err(ConnectError::AlreadyActive);
            }
            Self::set_lifecycle(&mut lifecycle, Lifecycle::Activating { cancelled: false });
        }

        let config = self.configuration();
        let client_id = self.shipper.client_id();
        let span = lifecycle_span!(
            "activate",
            client_id = %client_id,
            broker = %config.connection_string
        );

        async {
            let transport = match self.factory.create(&client_id, &config, &self.reconnect) {
                Ok(transport) => transport,
                Err(e) => {
                    error!(error = %e, "Failed to create MQTT transport");
                    Self::set_lifecycle(&mut self.lifecycle(), Lifecycle::Inactive);
                    return Err(ConnectError::from(e));
                }
            };

            if let Err(e) = transport.connect().await {
                error!(error = %e, "Failed to connect to MQTT broker");
                let _ = transport.disconnect().await;
                Self::set_lifecycle(&mut self.lifecycle(), Lifecycle::Inactive);
                return Err(ConnectError::from(e));
            }

            let cancelled = {
                let mut lifecycle = self.lifecycle();
                if matches!(*lifecycle, Lifecycle::Activating { cancelled: false }) {
                    self.reconnect_pending.store(false, Ordering::SeqCst);
                    Self::set_lifecycle(
                        &mut lifecycle,
                        Lifecycle::Active {
                            transport: transport.clone(),
                            config: config.clone(),
                        },
                    );
                    false
                } else {
                    true
                }
            };

            if cancelled {
                warn!("Deactivated while activating, closing new connection");
                let _ = transport.disconnect().await;
                Self::set_lifecycle(&mut self.lifecycle(), Lifecycle::Inactive);
                return Err(ConnectError::Failed(
                    "Deactivated during activation".to_string(),
                ));
            }

            info!(qos = %self.qos.load(), "MQTT log handler active");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Non-blocking liveness check
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), HandlerState::Active { connected: true })
    }

    /// Fresh publish channel, or None unless active and connected
    pub fn create_sender(&self) -> Option<MqttSender<F::Transport>> {
        let transport = match &*self.lifecycle() {
            Lifecycle::Active { transport, .. } if transport.is_connected() => transport.clone(),
            _ => return None,
        };

        let config = self.configuration();
        Some(MqttSender::new(
            transport,
            self.qos.clone(),
            self.topics.clone(),
            self.pool.clone(),
            config.max_packet_size as usize,
        ))
    }

    /// Validate and store a new configuration
    ///
    /// The QoS and topic prefix take effect on the next publish of every
    /// live sender.
    /// Connection-level settings are stored and used by the next activation.
    pub fn apply_configuration(
        &self,
        configuration: HandlerConfiguration,
    ) -> Result<Applied, ConfigRejected> {
        let section = match configuration {
            HandlerConfiguration::Mqtt(section) => section,
            HandlerConfiguration::Unsupported => {
                warn!("Rejected configuration that is not an MQTT handler configuration");
                metrics().configuration_rejected();
                return Err(ConfigRejected::NotMqtt);
            }
        };

        if let Err(e) = section.validate() {
            warn!(error = %e, "Rejected invalid MQTT configuration");
            metrics().configuration_rejected();
            return Err(ConfigRejected::Invalid(e.to_string()));
        }

        let lifecycle = self.lifecycle();
        let (live, address_change_pending) = match &*lifecycle {
            Lifecycle::Active { config, .. } => (true, config.requires_reconnect(&section)),
            _ => (false, false),
        };

        let new_qos = section.qos;
        let new_topics = TopicBuilder::new(&section.topic_prefix);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = section;
        let previous_qos = self.qos.store(new_qos);
        let previous_topics = self.topics.store(new_topics.clone());
        drop(lifecycle);

        if address_change_pending {
            self.reconnect_pending.store(true, Ordering::SeqCst);
            info!("Connection settings changed, they apply on the next activation");
        }
        if previous_qos != new_qos {
            info!(from = %previous_qos, to = %new_qos, "QoS updated");
        }
        let topic_prefix_updated = previous_topics != new_topics;
        if topic_prefix_updated {
            info!(
                from = previous_topics.prefix(),
                to = new_topics.prefix(),
                "Topic prefix updated"
            );
        }
        metrics().configuration_applied();

        Ok(Applied {
            live_qos_updated: live && previous_qos != new_qos,
            topic_prefix_updated,
            address_change_pending,
        })
    }

    /// Disconnect and release the connection; safe from any state
    pub async fn deactivate(&self) {
        let transport = {
            let mut lifecycle = self.lifecycle();
            let transport = match &mut *lifecycle {
                Lifecycle::Inactive | Lifecycle::Deactivating => return,
                Lifecycle::Activating { cancelled } => {
                    // The activation in flight tears its connection down
                    *cancelled = true;
                    return;
                }
                Lifecycle::Active { transport, .. } => transport.clone(),
            };
            Self::set_lifecycle(&mut lifecycle, Lifecycle::Deactivating);
            transport
        };

        let span = lifecycle_span!("deactivate", client_id = %self.shipper.client_id());
        async {
            if let Err(e) = transport.disconnect().await {
                warn!(error = %e, "Error during MQTT disconnect");
            }
            Self::set_lifecycle(&mut self.lifecycle(), Lifecycle::Inactive);
            info!("MQTT log handler inactive");
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransportFactory;

    fn handler() -> MqttLogHandler<MockTransportFactory> {
        MqttLogHandler::new(MockTransportFactory::new(), &ShipperConfig::test_config())
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let handler = handler();
        assert_eq!(handler.state(), HandlerState::Inactive);

        handler.activate().await.unwrap();
        assert_eq!(handler.state(), HandlerState::Active { connected: true });
        assert!(handler.is_connected());
        assert_eq!(
            handler.factory().client_ids(),
            vec!["log-shipper-test-instance".to_string()]
        );

        handler.deactivate().await;
        assert_eq!(handler.state(), HandlerState::Inactive);
        assert!(!handler.is_connected());
        assert!(handler.factory().last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_activate_twice_is_rejected() {
        let handler = handler();
        handler.activate().await.unwrap();

        let result = handler.activate().await;
        assert!(matches!(result, Err(ConnectError::AlreadyActive)));
        assert_eq!(handler.factory().created().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_activation_leaves_handler_inactive() {
        let handler = MqttLogHandler::new(
            MockTransportFactory::refusing(),
            &ShipperConfig::test_config(),
        );

        let result = handler.activate().await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
        assert_eq!(handler.state(), HandlerState::Inactive);
        assert!(handler.create_sender().is_none());

        // The half-built transport was torn down
        assert!(handler.factory().last().unwrap().is_closed());

        // And the handler can try again
        handler.factory().set_accept(true);
        handler.activate().await.unwrap();
        assert!(handler.is_connected());
    }

    #[tokio::test]
    async fn test_create_sender_requires_connection() {
        let handler = handler();
        assert!(handler.create_sender().is_none());

        handler.activate().await.unwrap();
        assert!(handler.create_sender().is_some());

        handler.factory().last().unwrap().simulate_disconnect();
        assert_eq!(handler.state(), HandlerState::Active { connected: false });
        assert!(matches!(
            handler.connection_state(),
            Some(ConnectionState::Disconnected(_))
        ));
        assert!(handler.create_sender().is_none());
    }

    #[tokio::test]
    async fn test_deactivate_from_any_state() {
        let handler = handler();
        handler.deactivate().await;
        handler.deactivate().await;
        assert_eq!(handler.state(), HandlerState::Inactive);

        handler.activate().await.unwrap();
        handler.deactivate().await;
        handler.deactivate().await;
        assert_eq!(handler.state(), HandlerState::Inactive);
        assert_eq!(handler.factory().last().unwrap().disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_apply_configuration_updates_qos() {
        let handler = handler();
        handler.activate().await.unwrap();

        let mut section = handler.configuration();
        section.qos = QualityOfService::ExactlyOnce;
        let applied = handler.apply_configuration(section.into()).unwrap();

        assert!(applied.live_qos_updated);
        assert!(!applied.address_change_pending);
        assert_eq!(handler.qos(), QualityOfService::ExactlyOnce);
        assert_eq!(handler.factory().created().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_configuration_keeps_previous() {
        let handler = handler();
        let before = handler.configuration();

        assert_eq!(
            handler.apply_configuration(HandlerConfiguration::Unsupported),
            Err(ConfigRejected::NotMqtt)
        );

        let mut bad = before.clone();
        bad.connection_string = String::new();
        bad.qos = QualityOfService::AtMostOnce;
        assert!(matches!(
            handler.apply_configuration(bad.into()),
            Err(ConfigRejected::Invalid(_))
        ));

        assert_eq!(handler.configuration(), before);
        assert_eq!(handler.qos(), before.qos);
    }

    #[tokio::test]
    async fn test_address_change_applies_on_next_activation() {
        let handler = handler();
        handler.activate().await.unwrap();

        let mut section = handler.configuration();
        section.connection_string = "mqtt://other-broker:1883".to_string();
        let applied = handler.apply_configuration(section.clone().into()).unwrap();
        assert!(applied.address_change_pending);
        assert!(!applied.live_qos_updated);
        assert!(handler.reconnect_pending());

        // The live connection is untouched
        assert!(handler.is_connected());
        assert_eq!(handler.factory().created().len(), 1);

        handler.deactivate().await;
        handler.activate().await.unwrap();
        assert_eq!(handler.factory().created().len(), 2);
        assert_eq!(handler.configuration(), section);
        assert!(!handler.reconnect_pending());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(HandlerState::Inactive.name(), "inactive");
        assert_eq!(HandlerState::Active { connected: true }.name(), "active");
        assert_eq!(
            HandlerState::Active { connected: false }.name(),
            "active_disconnected"
        );
    }
}
