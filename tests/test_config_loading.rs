//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use mqtt_log_shipper::config::{ConfigError, HandlerConfiguration, ShipperConfig};
use mqtt_log_shipper::qos::QualityOfService;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[shipper]
instance_id = "host-01"
client_id_prefix = "edge"
origin = "gateway"

[mqtt]
connection_string = "mqtts://broker.example.com"
qos = 2
keep_alive_secs = 30
topic_prefix = "site/logs"

[reconnect]
initial_delay_ms = 250
max_delay_ms = 10000
multiplier = 1.5
jitter = 0.1
max_attempts = 12
max_duration_secs = 120

[buffer]
capacity = 64
drain_timeout_ms = 2000
max_delivery_attempts = 2
"#,
    );

    let config = ShipperConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.shipper.client_id(), "edge-host-01");
    assert_eq!(config.shipper.default_origin(), "gateway");
    assert_eq!(config.mqtt.connection_string, "mqtts://broker.example.com");
    assert_eq!(config.mqtt.qos, QualityOfService::ExactlyOnce);
    assert_eq!(config.mqtt.keep_alive_secs, 30);
    assert_eq!(config.mqtt.topic_prefix, "site/logs");
    assert_eq!(config.buffer.capacity, 64);
    assert_eq!(config.buffer.drain_timeout(), Duration::from_secs(2));

    let reconnect = config.to_reconnect_config();
    assert_eq!(reconnect.initial_delay_ms, 250);
    assert_eq!(reconnect.max_attempts, Some(12));
    assert_eq!(reconnect.max_duration, Some(Duration::from_secs(120)));
}

#[test]
fn test_config_applies_defaults_when_sections_omitted() {
    let temp_file = write_config(
        r#"
[mqtt]
connection_string = "mqtt://localhost:1883"
"#,
    );

    let config = ShipperConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.qos, QualityOfService::AtLeastOnce);
    assert_eq!(config.mqtt.keep_alive_secs, 60);
    assert_eq!(config.mqtt.topic_prefix, "logs");
    assert_eq!(config.mqtt.publish_timeout(), Duration::from_millis(5000));
    assert_eq!(config.mqtt.max_packet_size, 256 * 1024);
    assert_eq!(config.buffer.capacity, 1024);
    assert_eq!(config.buffer.max_delivery_attempts, 5);
    assert_eq!(config.reconnect.initial_delay_ms, 100);
    assert_eq!(config.reconnect.max_attempts, None);

    // A generated instance id doubles as the default origin
    assert!(uuid::Uuid::parse_str(&config.shipper.instance_id).is_ok());
    assert_eq!(config.shipper.default_origin(), config.shipper.instance_id);
    assert!(config.shipper.client_id().starts_with("log-shipper-"));
}

#[test]
fn test_config_returns_error_when_mqtt_section_missing() {
    let temp_file = write_config(
        r#"
[shipper]
instance_id = "host-01"
"#,
    );

    let result = ShipperConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let temp_file = write_config("[mqtt\nconnection_string = ");

    let result = ShipperConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_empty_file() {
    let temp_file = write_config("");

    let result = ShipperConfig::load_from_file(temp_file.path());
    assert!(result.is_err());
}

#[test]
fn test_config_returns_error_when_file_not_found() {
    let result = ShipperConfig::load_from_file(std::path::Path::new(
        "/nonexistent/path/log-shipper.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_rejects_qos_outside_range() {
    let result = ShipperConfig::from_toml(
        r#"
[mqtt]
connection_string = "mqtt://localhost:1883"
qos = 5
"#,
    );
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_unparseable_address() {
    for address in ["", "mqtt://", "mqtt://host:notaport"] {
        let result = ShipperConfig::from_toml(&format!(
            r#"
[mqtt]
connection_string = "{address}"
"#
        ));
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "address {address:?} should be rejected"
        );
    }
}

#[test]
fn test_config_accepts_address_forms() {
    for address in [
        "mqtt://localhost:1883",
        "tcp://10.0.0.5:1884",
        "mqtts://broker.example.com",
        "ssl://broker.example.com:8883",
        "broker://test:1883",
        "localhost:1883",
    ] {
        let result = ShipperConfig::from_toml(&format!(
            r#"
[mqtt]
connection_string = "{address}"
"#
        ));
        assert!(result.is_ok(), "address {address:?} should be accepted");
    }
}

#[test]
fn test_config_returns_error_for_invalid_instance_id() {
    for instance_id in ["", "host 01", "host/01", "host#1"] {
        let result = ShipperConfig::from_toml(&format!(
            r#"
[shipper]
instance_id = "{instance_id}"

[mqtt]
connection_string = "mqtt://localhost:1883"
"#
        ));
        assert!(
            matches!(result, Err(ConfigError::InvalidInstanceId(_))),
            "instance id {instance_id:?} should be rejected"
        );
    }
}

#[test]
fn test_config_accepts_valid_instance_id_with_allowed_chars() {
    let result = ShipperConfig::from_toml(
        r#"
[shipper]
instance_id = "host-01.rack_3"

[mqtt]
connection_string = "mqtt://localhost:1883"
"#,
    );
    assert!(result.is_ok());
}

#[test]
fn test_config_rejects_wildcard_topic_prefix() {
    let result = ShipperConfig::from_toml(
        r#"
[mqtt]
connection_string = "mqtt://localhost:1883"
topic_prefix = "logs/+"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_invalid_reconnect_policy() {
    let cases = [
        "initial_delay_ms = 0",
        "initial_delay_ms = 500\nmax_delay_ms = 100",
        "multiplier = 0.5",
        "jitter = 1.5",
        "max_attempts = 0",
    ];

    for case in cases {
        let result = ShipperConfig::from_toml(&format!(
            r#"
[mqtt]
connection_string = "mqtt://localhost:1883"

[reconnect]
{case}
"#
        ));
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "reconnect policy {case:?} should be rejected"
        );
    }
}

#[test]
fn test_config_rejects_empty_buffer() {
    let result = ShipperConfig::from_toml(
        r#"
[mqtt]
connection_string = "mqtt://localhost:1883"

[buffer]
capacity = 0
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_mqtt_credentials_resolve_from_environment() {
    let config = ShipperConfig::from_toml(
        r#"
[mqtt]
connection_string = "mqtt://localhost:1883"
username_env = "LOG_SHIPPER_TEST_USER"
password_env = "LOG_SHIPPER_TEST_PASS_UNSET"
"#,
    )
    .unwrap();

    std::env::set_var("LOG_SHIPPER_TEST_USER", "shipper");
    assert_eq!(config.mqtt.username(), Some("shipper".to_string()));
    assert_eq!(config.mqtt.password(), None);
    std::env::remove_var("LOG_SHIPPER_TEST_USER");
}

#[test]
fn test_handler_configuration_tag_is_checked() {
    let mqtt = HandlerConfiguration::from_toml(
        r#"
type = "mqtt"
connection_string = "broker://test:1883"
qos = 1
"#,
    )
    .unwrap();
    match mqtt {
        HandlerConfiguration::Mqtt(section) => {
            assert_eq!(section.connection_string, "broker://test:1883");
            assert_eq!(section.qos, QualityOfService::AtLeastOnce);
            assert_eq!(section.topic_prefix, "logs");
        }
        other => panic!("expected an MQTT configuration, got {other:?}"),
    }

    let other = HandlerConfiguration::from_toml(
        r#"
type = "syslog"
"#,
    )
    .unwrap();
    assert_eq!(other, HandlerConfiguration::Unsupported);
}

#[test]
fn test_config_survives_toml_round_trip_for_show() {
    let config = ShipperConfig::from_toml(
        r#"
[shipper]
instance_id = "host-01"

[mqtt]
connection_string = "mqtt://localhost:1883"
qos = 1
username_env = "MQTT_USER"

[reconnect]
max_attempts = 3
"#,
    )
    .unwrap();

    let shown = toml::to_string_pretty(&config).unwrap();
    let reparsed = ShipperConfig::from_toml(&shown).unwrap();
    assert_eq!(reparsed, config);
}
