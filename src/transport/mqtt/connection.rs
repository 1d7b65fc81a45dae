//! Pure connection state management for the MQTT transport
//!
//! This module contains connection state, reconnection backoff, broker
//! address parsing and rumqttc option building. Nothing here touches the
//! network.

use crate::config::MqttSection;
use crate::protocol::{
    encode_payload, validate_client_id, validate_publish_topic, validate_topic_filter,
    StatusMessage, STATUS_TOPIC,
};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{MqttOptions, QoS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Largest packet accepted in either direction
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Fixed header, topic length prefix and packet id
const PUBLISH_OVERHEAD: usize = 2 + 4 + 2;

/// Connection state for the MQTT transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live session; publishes report RetryLater
    Disconnected,
    /// Connect or reconnect in progress
    Connecting,
    /// ConnAck received and ready for operations
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnection configuration
///
/// Delays double from `min_delay` on each failed attempt and stop growing
/// at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(section: &MqttSection) -> Self {
        Self {
            enabled: section.automatic_reconnect,
            min_delay: Duration::from_secs(section.min_retry_secs),
            max_delay: Duration::from_secs(section.max_retry_secs),
        }
    }

    /// Backoff before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Message the broker publishes for us after an unclean disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
        }
    }

    /// Retained `offline` presence for a sensor node
    pub fn sensor_offline(sensor_id: u32) -> Result<Self, TransportError> {
        let payload = encode_payload(&StatusMessage::offline(sensor_id))?;
        Ok(Self::new(STATUS_TOPIC, payload, QoS::AtLeastOnce, true))
    }
}

/// Topic filter requested at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// Everything needed to open and run one broker connection
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<(String, String)>,
    pub last_will: Option<LastWill>,
    pub subscriptions: Vec<Subscription>,
    pub reconnect: ReconnectConfig,
    pub run_background_pump: bool,
    pub pump_interval: Duration,
    pub max_inflight: u16,
    pub request_capacity: usize,
    pub disconnect_grace: Duration,
    pub connect_timeout: Duration,
}

impl TransportOptions {
    /// Build options from the `[mqtt]` section, resolving credentials now
    pub fn from_section(section: &MqttSection) -> Self {
        let credentials = section
            .username()
            .map(|username| (username, section.password().unwrap_or_default()));

        Self {
            broker_url: section.broker_url.clone(),
            client_id: section.client_id.clone(),
            keep_alive: section.keep_alive(),
            clean_session: section.clean_session,
            credentials,
            last_will: None,
            subscriptions: Vec::new(),
            reconnect: ReconnectConfig::from_section(section),
            run_background_pump: section.run_background_pump,
            pump_interval: section.pump_interval(),
            max_inflight: section.max_inflight,
            request_capacity: section.request_capacity,
            disconnect_grace: section.disconnect_grace(),
            connect_timeout: section.connect_timeout(),
        }
    }

    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn with_subscription(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.subscriptions.push(Subscription::new(filter, qos));
        self
    }

    /// Reject malformed identifiers before anything reaches the network
    pub fn validate(&self) -> Result<(), TransportError> {
        validate_client_id(&self.client_id)
            .map_err(|e| TransportError::InvalidConfig(format!("client id: {e}")))?;
        parse_broker_address(&self.broker_url)?;

        if let Some(will) = &self.last_will {
            validate_publish_topic(&will.topic)
                .map_err(|e| TransportError::InvalidConfig(format!("last will: {e}")))?;
        }
        for subscription in &self.subscriptions {
            validate_topic_filter(&subscription.filter)
                .map_err(|e| TransportError::InvalidConfig(format!("subscription: {e}")))?;
        }
        if self.max_inflight == 0 {
            return Err(TransportError::InvalidConfig(
                "max_inflight must be greater than 0".to_string(),
            ));
        }
        if self.request_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "request_capacity must be greater than 0".to_string(),
            ));
        }
        if self.pump_interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "pump interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed address, client id or topic; raised before connecting
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
    /// Broker refused or unreachable during the initial connect
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or a bare `host[:port]`
pub fn parse_broker_address(broker_url: &str) -> Result<BrokerAddress, TransportError> {
    let invalid = || TransportError::InvalidConfig(format!("broker url: {broker_url}"));

    let trimmed = broker_url.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }
    let normalized = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("tcp://{trimmed}")
    };

    let url = Url::parse(&normalized).map_err(|_| invalid())?;
    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" => true,
        _ => return Err(invalid()),
    };
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(invalid)?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// Whether a publish fits in one packet
pub fn fits_packet(topic: &str, payload_len: usize) -> bool {
    topic.len() + payload_len + PUBLISH_OVERHEAD <= MAX_PACKET_SIZE
}

/// Build rumqttc options from transport options
pub fn configure_mqtt_options(options: &TransportOptions) -> Result<MqttOptions, TransportError> {
    options.validate()?;
    let address = parse_broker_address(&options.broker_url)?;

    let mut mqtt_options = MqttOptions::new(&options.client_id, &address.host, address.port);

    if address.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_inflight(options.max_inflight);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            &will.topic,
            will.payload.clone(),
            will.qos,
            will.retain,
        ));
    }

    Ok(mqtt_options)
}
