//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use std::io::Write;
use std::time::Duration;
use techtemp::config::{ConfigError, TechTempConfig};
use techtemp::monitor::MonitorSettings;
use techtemp::transport::mqtt::TransportOptions;
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
[mqtt]
broker_url = "tcp://broker.local:1883"
client_id = "techtemp_server"
keep_alive_secs = 30
max_inflight = 4

[monitor]
max_devices = 20
warning_after_secs = 300
offline_after_secs = 900

[monitor.rooms]
"5" = "garage"

[http]
port = 9090
"#,
    );

    let config = TechTempConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "tcp://broker.local:1883");
    assert_eq!(config.mqtt.client_id, "techtemp_server");
    assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.mqtt.max_inflight, 4);
    assert_eq!(config.monitor.max_devices, 20);
    assert_eq!(config.http.port, 9090);

    let settings = MonitorSettings::from_config(&config);
    assert_eq!(settings.max_devices, 20);
    assert_eq!(settings.rooms.resolve(5), "garage");
    assert_eq!(settings.rooms.resolve(1), "salon");
    assert_eq!(settings.thresholds.warning_after, chrono::Duration::minutes(5));
}

#[test]
fn test_sensor_node_config() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "192.168.1.50"
client_id = "sensor_3"

[sensor]
sensor_id = 3
room_id = 4
capture_interval_secs = 60
publish_attempts = 3
"#,
    );

    let config = TechTempConfig::load_from_file(temp_file.path()).unwrap();
    let sensor = config.sensor().unwrap();

    assert_eq!(sensor.sensor_id, 3);
    assert_eq!(sensor.room_id, 4);
    assert_eq!(sensor.capture_interval_secs, 60);
    assert_eq!(sensor.publish_attempts, 3);
    assert_eq!(sensor.retry_delay_ms, 200);
}

#[test]
fn test_transport_options_follow_mqtt_section() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com"
client_id = "techtemp_server"
automatic_reconnect = false
min_retry_secs = 2
max_retry_secs = 10
request_capacity = 32
"#,
    );

    let config = TechTempConfig::load_from_file(temp_file.path()).unwrap();
    let options = TransportOptions::from_section(&config.mqtt);

    assert_eq!(options.client_id, "techtemp_server");
    assert!(!options.reconnect.enabled);
    assert_eq!(options.reconnect.min_delay, Duration::from_secs(2));
    assert_eq!(options.reconnect.max_delay, Duration::from_secs(10));
    assert_eq!(options.request_capacity, 32);
    assert!(options.validate().is_ok());
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = TechTempConfig::load_from_file(std::path::Path::new("/nonexistent/techtemp.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = TechTempConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_without_mqtt_section() {
    let temp_file = write_config("[http]\nport = 8080\n");
    let result = TechTempConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_bad_client_id() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "tcp://localhost:1883"
client_id = "server/1"
"#,
    );
    let result = TechTempConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_rejects_zero_capacity() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "tcp://localhost:1883"
client_id = "techtemp_server"

[monitor]
max_devices = 0
"#,
    );
    let result = TechTempConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "tcp://localhost:1883"
client_id = "techtemp_server"

[sensor]
sensor_id = 7
room_id = 2
"#,
    );
    let config = TechTempConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = TechTempConfig::from_toml_str(&rendered).unwrap();

    assert_eq!(reparsed, config);
}
