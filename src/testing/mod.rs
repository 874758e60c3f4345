//! Testing utilities and mock implementations
//!
//! Mock transports for exercising the handler, senders and the service
//! without an MQTT broker.

pub mod mocks;

pub use mocks::*;
