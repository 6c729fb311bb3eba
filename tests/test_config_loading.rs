//! Loading `vibus.toml` files from disk

use rumqttc::QoS;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use vibus_live::config::{ConfigError, LiveConfig};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_config_file() {
    // Arrange
    let file = write_config(
        r#"
[broker]
host = "mqtt.vibus.example"
port = 1884
client_id_prefix = "dashboard"
keep_alive_secs = 30

[reconnect]
auto_reconnect = true
base_delay_ms = 500
max_delay_ms = 8000

[cache]
max_age_secs = 120
cleanup_interval_secs = 15

[channels]
event_buffer = 32
message_buffer = 256

[parser]
strict_validation = true

[http]
enabled = true
port = 9090

[[subscriptions]]
topic = "vibus/autobus/+/posizione"
qos = 1

[[subscriptions]]
topic = "vibus/sistema/+/stato"
qos = 0
"#,
    );

    // Act
    let config = LiveConfig::load_from_file(file.path()).unwrap();

    // Assert
    let broker = config.broker_config().unwrap();
    assert_eq!(broker.broker_url(), "tcp://mqtt.vibus.example:1884");
    assert_eq!(config.broker.client_id_prefix, "dashboard");
    assert_eq!(config.keep_alive(), Duration::from_secs(30));

    let reconnect = config.reconnect_config();
    assert_eq!(reconnect.base_delay, Duration::from_millis(500));
    assert_eq!(reconnect.max_delay, Duration::from_millis(8000));

    assert_eq!(config.cache_max_age(), Duration::from_secs(120));
    assert_eq!(config.cache_cleanup_interval(), Duration::from_secs(15));
    assert_eq!(config.channels.message_buffer, 256);
    assert!(config.parser.strict_validation);
    assert!(config.http.enabled);
    assert_eq!(config.http.port, 9090);

    assert_eq!(
        config.subscription_set(),
        vec![
            ("vibus/autobus/+/posizione".to_string(), QoS::AtLeastOnce),
            ("vibus/sistema/+/stato".to_string(), QoS::AtMostOnce),
        ]
    );
}

#[test]
fn test_broker_url_with_credentials_from_environment() {
    std::env::set_var("VIBUS_TEST_CONFIG_USER", "operator");
    std::env::set_var("VIBUS_TEST_CONFIG_PASS", "s3cret");
    let file = write_config(
        r#"
[broker]
url = "ssl://broker.vibus.example"
username_env = "VIBUS_TEST_CONFIG_USER"
password_env = "VIBUS_TEST_CONFIG_PASS"
"#,
    );

    let config = LiveConfig::load_from_file(file.path()).unwrap();
    let broker = config.broker_config().unwrap();

    assert!(broker.use_ssl);
    assert_eq!(broker.port, 8883);
    assert_eq!(broker.host, "broker.vibus.example");
    assert_eq!(broker.username.as_deref(), Some("operator"));
    assert_eq!(broker.password.as_deref(), Some("s3cret"));
}

#[test]
fn test_unset_credential_variables_leave_anonymous_session() {
    let file = write_config(
        r#"
[broker]
host = "localhost"
username_env = "VIBUS_TEST_CONFIG_UNSET_USER"
"#,
    );

    let broker = LiveConfig::load_from_file(file.path())
        .unwrap()
        .broker_config()
        .unwrap();

    assert!(broker.username.is_none());
    assert!(broker.password.is_none());
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("vibus.toml");

    let result = LiveConfig::load_from_file(&missing);

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[broker\nhost = ");

    let result = LiveConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_fail_validation() {
    let file = write_config(
        r#"
[broker]
host = "localhost"

[reconnect]
base_delay_ms = 5000
max_delay_ms = 1000
"#,
    );

    let result = LiveConfig::load_from_file(file.path());

    match result {
        Err(ConfigError::InvalidConfig(message)) => assert!(message.contains("max_delay_ms")),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_serialized_config_loads_back() {
    let mut config = LiveConfig::for_broker("broker.local", 1883);
    config.http.enabled = true;
    let file = write_config(&toml::to_string_pretty(&config).unwrap());

    let loaded = LiveConfig::load_from_file(file.path()).unwrap();

    assert_eq!(loaded, config);
}
