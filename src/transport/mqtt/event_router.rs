//! Pure routing of rumqttc events for the connection supervisor
//!
//! Nothing in here performs I/O. The supervisor in `client` feeds every event
//! and error from the event loop through these functions and acts on the
//! result.

use rumqttc::v5::mqttbytes::v5::{Packet, PubAckReason, PubCompReason, PubRecReason};
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;

/// Pure routing decisions based on MQTT events
pub struct EventRouter;

impl EventRouter {
    /// Route MQTT event to the supervisor action it calls for
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::PubAck(puback) => match puback.reason {
                    PubAckReason::Success | PubAckReason::NoMatchingSubscribers => {
                        EventRoute::PublishAcknowledged(puback.pkid)
                    }
                    ref reason => EventRoute::PublishRejected {
                        pkid: puback.pkid,
                        reason: format!("{reason:?}"),
                    },
                },
                Packet::PubRec(pubrec) => match pubrec.reason {
                    PubRecReason::Success | PubRecReason::NoMatchingSubscribers => {
                        EventRoute::InfrastructureEvent("PubRec".to_string())
                    }
                    ref reason => EventRoute::PublishRejected {
                        pkid: pubrec.pkid,
                        reason: format!("{reason:?}"),
                    },
                },
                Packet::PubComp(pubcomp) => match pubcomp.reason {
                    PubCompReason::Success => EventRoute::PublishAcknowledged(pubcomp.pkid),
                    ref reason => EventRoute::PublishRejected {
                        pkid: pubcomp.pkid,
                        reason: format!("{reason:?}"),
                    },
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent(*pkid),
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify an event loop error
    ///
    /// A refused CONNECT will be refused again with the same credentials, so
    /// it ends reconnection. `RequestsDone` means every client handle was
    /// dropped and nothing can publish anymore.
    pub fn classify_connection_error(error: &ConnectionError) -> ConnectionFailure {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                ConnectionFailure::Refused(format!("{code:?}"))
            }
            ConnectionError::RequestsDone => ConnectionFailure::Closed,
            other => ConnectionFailure::Transient(other.to_string()),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish
    ConnectionAcknowledged,
    /// Broker sent DISCONNECT with this reason
    Disconnected(String),
    /// A PUBLISH left the event loop with this packet id
    PublishSent(u16),
    /// Final acknowledgement for the QoS level arrived
    PublishAcknowledged(u16),
    /// Broker answered with a failure reason code
    PublishRejected { pkid: u16, reason: String },
    /// Our own DISCONNECT was written
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// How the supervisor should treat an event loop error
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionFailure {
    /// Broker refused the session
    Refused(String),
    /// Client side of the request channel is gone
    Closed,
    /// Network or protocol failure worth retrying
    Transient(String),
}
