//! Test helpers and utilities for integration tests

use mqtt_log_shipper::config::ShipperConfig;
use mqtt_log_shipper::qos::QualityOfService;
use mqtt_log_shipper::testing::MockTransportFactory;
use mqtt_log_shipper::MqttLogHandler;

/// Broker address the mock transports accept
#[allow(dead_code)]
pub const TEST_BROKER: &str = "broker://test:1883";

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config(connection_string: &str, qos: QualityOfService) -> ShipperConfig {
    ShipperConfig::from_toml(&format!(
        r#"
[shipper]
instance_id = "test-instance"

[mqtt]
connection_string = "{connection_string}"
qos = {level}

[reconnect]
initial_delay_ms = 1
max_delay_ms = 10
jitter = 0.0

[buffer]
capacity = 16
drain_timeout_ms = 500
max_delivery_attempts = 3
"#,
        level = qos.level()
    ))
    .unwrap()
}

/// Handler over mock transports with the default test configuration
#[allow(dead_code)]
pub fn mock_handler(qos: QualityOfService) -> MqttLogHandler<MockTransportFactory> {
    MqttLogHandler::new(MockTransportFactory::new(), &test_config(TEST_BROKER, qos))
}
