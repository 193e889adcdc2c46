//! Configuration loading and validation tests
//!
//! Tests exercise files on disk and check the observable config, not TOML internals.

use mqtt_eventbus::config::{ConfigError, EventBusConfig, DEFAULT_BROKER_NAME};
use mqtt_eventbus::protocol::QoS;
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
    let file = write_config(
        r#"
[mqtt]
host = "broker.internal"
port = 8883
client_id = "billing-1"
use_tls = true
keepalive = 30
reconnect_interval = 2.5
max_reconnect_attempts = 4
topic_prefix = "site-a"

[service]
broker_name = "primary"
max_concurrent_handlers = 16
subscriber_qos = 2

[[subscriptions]]
id = "alerts"
topics = ["alerts/#"]
handler = "log"

[[subscriptions]]
id = "meters"
topics = ["meters/+/reading"]
handler = "log"
enabled = false
"#,
    );

    let config = EventBusConfig::load_from_file(file.path()).unwrap();

    let mqtt = config.mqtt.expect("mqtt section present");
    assert_eq!(mqtt.host, "broker.internal");
    assert_eq!(mqtt.port, 8883);
    assert_eq!(mqtt.client_id, "billing-1");
    assert!(mqtt.use_tls);
    assert_eq!(mqtt.keepalive_duration(), Duration::from_secs(30));
    assert_eq!(mqtt.reconnect_delay(), Duration::from_millis(2500));
    assert_eq!(mqtt.max_reconnect_attempts, 4);
    assert_eq!(mqtt.topic_prefix, "site-a");

    assert_eq!(config.service.broker_name, "primary");
    assert_eq!(config.service.max_concurrent_handlers, 16);
    assert_eq!(config.service.subscriber_qos, QoS::ExactlyOnce);

    assert_eq!(config.subscriptions.len(), 2);
    assert!(config.subscriptions[0].enabled);
    assert!(!config.subscriptions[1].enabled);
}

#[test]
fn test_missing_sections_use_defaults() {
    let file = write_config("");
    let config = EventBusConfig::load_from_file(file.path()).unwrap();

    assert!(config.mqtt.is_none());
    assert_eq!(config.service.broker_name, DEFAULT_BROKER_NAME);
    assert_eq!(config.service.subscriber_qos, QoS::AtLeastOnce);
    assert!(config.subscriptions.is_empty());
}

#[test]
fn test_environment_substitution() {
    std::env::set_var("EVENTBUS_IT_MQTT_HOST", "from-env.local");
    std::env::remove_var("EVENTBUS_IT_MQTT_PORT");

    let file = write_config(
        r#"
[mqtt]
host = "${EVENTBUS_IT_MQTT_HOST}"
port = ${EVENTBUS_IT_MQTT_PORT:-1884}
"#,
    );

    let mqtt = EventBusConfig::load_from_file(file.path())
        .unwrap()
        .mqtt
        .unwrap();
    assert_eq!(mqtt.host, "from-env.local");
    assert_eq!(mqtt.port, 1884);
}

#[test]
fn test_missing_environment_variable_is_an_error() {
    std::env::remove_var("EVENTBUS_IT_UNSET");
    let file = write_config("[mqtt]\nhost = \"${EVENTBUS_IT_UNSET}\"\n");

    let result = EventBusConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "EVENTBUS_IT_UNSET"));
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[mqtt]\nport = 0\n",
        "[mqtt]\nkeepalive = 0\n",
        "[mqtt]\nreconnect_interval = -1.0\n",
        "[service]\nmax_concurrent_handlers = 0\n",
        "[[subscriptions]]\nid = \"\"\ntopics = [\"a\"]\nhandler = \"log\"\n",
    ];

    for content in cases {
        let file = write_config(content);
        let result = EventBusConfig::load_from_file(file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "expected rejection for {content:?}"
        );
    }
}

#[test]
fn test_malformed_toml_and_missing_file() {
    let file = write_config("[mqtt\nhost = ");
    assert!(matches!(
        EventBusConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));

    let missing = std::path::Path::new("/nonexistent/eventbus.toml");
    assert!(matches!(
        EventBusConfig::load_from_file(missing),
        Err(ConfigError::FileRead(_))
    ));
}

#[test]
fn test_invalid_qos_is_a_parse_error() {
    let file = write_config("[service]\nsubscriber_qos = 3\n");
    assert!(matches!(
        EventBusConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}
