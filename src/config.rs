//! Configuration system for the TechTemp server and sensor nodes
//!
//! One TOML file describes the broker connection, the liveness monitor and
//! the HTTP export. The `[sensor]` section is only needed on sensor nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechTempConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub http: HttpSection,
    /// Present on sensor nodes only
    pub sensor: Option<SensorSection>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker address: `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or a bare host
    pub broker_url: String,
    /// Client identifier, unique per concurrently connected client
    pub client_id: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub automatic_reconnect: bool,
    #[serde(default = "default_min_retry_secs")]
    pub min_retry_secs: u64,
    #[serde(default = "default_max_retry_secs")]
    pub max_retry_secs: u64,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_true")]
    pub run_background_pump: bool,
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
    /// Outstanding QoS 1/2 publishes allowed before publish reports RetryLater
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    /// Depth of the client request queue feeding the event loop
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl MqttSection {
    /// Settings for a local broker with the given client id
    pub fn local(client_id: &str) -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: client_id.to_string(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: true,
            automatic_reconnect: true,
            min_retry_secs: default_min_retry_secs(),
            max_retry_secs: default_max_retry_secs(),
            username_env: None,
            password_env: None,
            run_background_pump: true,
            pump_interval_ms: default_pump_interval_ms(),
            max_inflight: default_max_inflight(),
            request_capacity: default_request_capacity(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    20
}

fn default_min_retry_secs() -> u64 {
    1
}

fn default_max_retry_secs() -> u64 {
    30
}

fn default_pump_interval_ms() -> u64 {
    20
}

fn default_max_inflight() -> u16 {
    10
}

fn default_request_capacity() -> usize {
    10
}

fn default_disconnect_grace_ms() -> u64 {
    2000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Liveness monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSection {
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Silence longer than this marks a device Warning
    #[serde(default = "default_warning_after_secs")]
    pub warning_after_secs: u64,
    /// Silence longer than this marks a device Offline
    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: u64,
    /// Extra room names keyed by room id, merged over the built-in table
    #[serde(default)]
    pub rooms: BTreeMap<String, String>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            max_devices: default_max_devices(),
            warning_after_secs: default_warning_after_secs(),
            offline_after_secs: default_offline_after_secs(),
            rooms: BTreeMap::new(),
        }
    }
}

fn default_max_devices() -> usize {
    10
}

fn default_warning_after_secs() -> u64 {
    10 * 60
}

fn default_offline_after_secs() -> u64 {
    30 * 60
}

/// HTTP export settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

/// Sensor node settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSection {
    pub sensor_id: u32,
    pub room_id: u32,
    #[serde(default = "default_capture_interval_secs")]
    pub capture_interval_secs: u64,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_capture_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_publish_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Missing [{0}] section")]
    MissingSection(&'static str),
    #[error("No configuration file found, tried: {0}")]
    NotFound(String),
}

/// Searched in order when no path is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["techtemp.toml", "config/techtemp.toml"];

impl TechTempConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `explicit`, or from the first default path that exists
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load_from_file(path)?, path.to_path_buf()));
        }
        let path = DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or_else(|| ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")))?;
        Ok((Self::load_from_file(&path)?, path))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TechTempConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::protocol::validate_client_id(&self.mqtt.client_id)
            .map_err(|e| ConfigError::InvalidClientId(e.to_string()))?;

        if self.mqtt.min_retry_secs > self.mqtt.max_retry_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "min_retry_secs ({}) must not exceed max_retry_secs ({})",
                self.mqtt.min_retry_secs, self.mqtt.max_retry_secs
            )));
        }

        if self.mqtt.pump_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "pump_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "request_capacity must be greater than 0".to_string(),
            ));
        }

        if self.monitor.max_devices == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_devices must be greater than 0".to_string(),
            ));
        }

        if self.monitor.warning_after_secs >= self.monitor.offline_after_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "warning_after_secs ({}) must be lower than offline_after_secs ({})",
                self.monitor.warning_after_secs, self.monitor.offline_after_secs
            )));
        }

        for key in self.monitor.rooms.keys() {
            if key.parse::<u32>().is_err() {
                return Err(ConfigError::InvalidConfig(format!(
                    "room key '{key}' is not a room id"
                )));
            }
        }

        if let Some(sensor) = &self.sensor {
            if sensor.publish_attempts == 0 {
                return Err(ConfigError::InvalidConfig(
                    "publish_attempts must be greater than 0".to_string(),
                ));
            }
            if sensor.capture_interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "capture_interval_secs must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Sensor section, required by sensor nodes
    pub fn sensor(&self) -> Result<&SensorSection, ConfigError> {
        self.sensor.as_ref().ok_or(ConfigError::MissingSection("sensor"))
    }

    /// Room name overrides with numeric keys
    pub fn room_overrides(&self) -> BTreeMap<u32, String> {
        self.monitor
            .rooms
            .iter()
            .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| (id, v.clone())))
            .collect()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "tcp://localhost:1883"
client_id = "techtemp_test"

[monitor]
max_devices = 3
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
