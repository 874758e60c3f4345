//! Quality-of-service levels and the shared, atomically updated QoS cell
//!
//! The QoS is configuration that changes at runtime while senders are
//! publishing concurrently, so it lives in an `AtomicU8` rather than behind
//! a lock.

use rumqttc::v5::mqttbytes::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Delivery guarantee level for a published log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QualityOfService {
    /// QoS 0 - fire and forget
    AtMostOnce,
    /// QoS 1 - acknowledged with PUBACK, may duplicate
    AtLeastOnce,
    /// QoS 2 - four-step handshake, completed on PUBCOMP
    ExactlyOnce,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid quality of service level {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

impl QualityOfService {
    pub fn level(self) -> u8 {
        match self {
            QualityOfService::AtMostOnce => 0,
            QualityOfService::AtLeastOnce => 1,
            QualityOfService::ExactlyOnce => 2,
        }
    }

    /// Map to the rumqttc wire level
    pub fn to_mqtt(self) -> QoS {
        match self {
            QualityOfService::AtMostOnce => QoS::AtMostOnce,
            QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
            QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl Default for QualityOfService {
    fn default() -> Self {
        QualityOfService::AtLeastOnce
    }
}

impl TryFrom<u8> for QualityOfService {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            2 => Ok(QualityOfService::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QualityOfService> for u8 {
    fn from(qos: QualityOfService) -> Self {
        qos.level()
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", self.level())
    }
}

/// QoS cell shared between a handler and every sender it creates
///
/// A store is visible to the next `load`, never to a publish that already
/// read the previous value.
#[derive(Debug)]
pub struct SharedQos(AtomicU8);

impl SharedQos {
    pub fn new(qos: QualityOfService) -> Self {
        Self(AtomicU8::new(qos.level()))
    }

    pub fn load(&self) -> QualityOfService {
        // Only valid levels are ever stored
        QualityOfService::try_from(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Store a new level, returning the previous one
    pub fn store(&self, qos: QualityOfService) -> QualityOfService {
        let previous = self.0.swap(qos.level(), Ordering::AcqRel);
        QualityOfService::try_from(previous).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(
            QualityOfService::try_from(0),
            Ok(QualityOfService::AtMostOnce)
        );
        assert_eq!(
            QualityOfService::try_from(1),
            Ok(QualityOfService::AtLeastOnce)
        );
        assert_eq!(
            QualityOfService::try_from(2),
            Ok(QualityOfService::ExactlyOnce)
        );
        assert_eq!(QualityOfService::try_from(3), Err(InvalidQos(3)));
    }

    #[test]
    fn test_qos_maps_to_wire_level() {
        assert_eq!(QualityOfService::AtMostOnce.to_mqtt(), QoS::AtMostOnce);
        assert_eq!(QualityOfService::AtLeastOnce.to_mqtt(), QoS::AtLeastOnce);
        assert_eq!(QualityOfService::ExactlyOnce.to_mqtt(), QoS::ExactlyOnce);
    }

    #[test]
    fn test_qos_serde_as_integer() {
        let json = serde_json::to_string(&QualityOfService::ExactlyOnce).unwrap();
        assert_eq!(json, "2");

        let parsed: QualityOfService = serde_json::from_str("0").unwrap();
        assert_eq!(parsed, QualityOfService::AtMostOnce);

        assert!(serde_json::from_str::<QualityOfService>("7").is_err());
    }

    #[test]
    fn test_shared_qos_swap() {
        let cell = SharedQos::new(QualityOfService::AtLeastOnce);
        assert_eq!(cell.load(), QualityOfService::AtLeastOnce);

        let previous = cell.store(QualityOfService::ExactlyOnce);
        assert_eq!(previous, QualityOfService::AtLeastOnce);
        assert_eq!(cell.load(), QualityOfService::ExactlyOnce);
    }

    #[test]
    fn test_display() {
        assert_eq!(QualityOfService::AtMostOnce.to_string(), "QoS0");
    }
}
