//! Tests for logging setup from outside the crate
//!
//! Format and level parsing are covered by the unit tests; these check the
//! environment-driven entry points and the exported span macros.

use mqtt_log_shipper::observability::logging::{
    format_from_env, init_default_logging, init_logging, spans_from_env, LogFormat,
};
use mqtt_log_shipper::{lifecycle_span, mqtt_span};
use tracing::Level;

#[test]
fn test_format_and_spans_follow_environment() {
    std::env::set_var("LOG_FORMAT", "pretty");
    std::env::set_var("LOG_SPANS", "TRUE");
    assert!(matches!(format_from_env(), LogFormat::Pretty));
    assert!(spans_from_env());

    std::env::remove_var("LOG_FORMAT");
    std::env::remove_var("LOG_SPANS");
    assert!(matches!(format_from_env(), LogFormat::Json));
    assert!(!spans_from_env());
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    init_default_logging();
    init_logging(Level::DEBUG, LogFormat::Compact, false);
    tracing::info!("logging initialized");
}

#[test]
fn test_span_macros_carry_operation() {
    init_logging(Level::INFO, LogFormat::Json, true);

    let topic = "logs/svc-A";
    let span = mqtt_span!("publish", topic = %topic, qos = 1u8);
    let _entered = span.enter();

    let lifecycle = lifecycle_span!("activate");
    let _inner = lifecycle.enter();
    tracing::info!("inside spans");
}
