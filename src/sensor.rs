//! Sensor node control loop
//!
//! A node announces itself on `weather/status`, captures a reading on a
//! fixed schedule and whenever a matching capture command arrives on
//! `weather/command`, and announces `offline` before it disconnects. The
//! broker publishes the same `offline` message as the node's last will if
//! the node vanishes without saying goodbye.

use crate::config::{SensorSection, TechTempConfig};
use crate::protocol::{
    encode_payload, CaptureTrigger, Command, CommandAction, Presence, StatusMessage, Telemetry,
    COMMAND_TOPIC, STATUS_TOPIC, WEATHER_TOPIC,
};
use crate::transport::mqtt::{LastWill, TransportOptions};
use crate::transport::retry::{publish_with_retry, RetryPolicy};
use crate::transport::{InboundMessage, PublishOutcome, QoS, Transport, TransportError, TransportHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Acknowledgment wait for presence announcements
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// One measurement from the sensor hardware
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("Sensor read failed: {0}")]
    ReadFailed(String),
}

/// Sensor hardware
#[async_trait]
pub trait ReadingSource: Send + Sync {
    async fn read(&self) -> Result<Reading, SourceError>;
}

/// Deterministic stand-in for the temperature/humidity sensor
#[derive(Debug)]
pub struct SimulatedSource {
    base_temperature: f64,
    base_humidity: f64,
    step: AtomicU64,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(21.0, 50.0)
    }
}

impl SimulatedSource {
    pub fn new(base_temperature: f64, base_humidity: f64) -> Self {
        Self {
            base_temperature,
            base_humidity,
            step: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ReadingSource for SimulatedSource {
    async fn read(&self) -> Result<Reading, SourceError> {
        let step = self.step.fetch_add(1, Ordering::Relaxed) as f64;
        let temperature = self.base_temperature + 1.5 * (step * 0.3).sin();
        let humidity = self.base_humidity + 5.0 * (step * 0.2).cos();
        Ok(Reading {
            temperature: (temperature * 100.0).round() / 100.0,
            humidity: humidity.round().clamp(0.0, 100.0),
        })
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Reading not delivered: {0}")]
    NotDelivered(PublishOutcome),
}

/// Node identity and publish behavior
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub sensor_id: u32,
    pub room_id: u32,
    pub capture_interval: Duration,
    /// Policy for telemetry publishes
    pub retry: RetryPolicy,
}

impl SensorSettings {
    pub fn from_section(section: &SensorSection) -> Self {
        Self {
            sensor_id: section.sensor_id,
            room_id: section.room_id,
            capture_interval: Duration::from_secs(section.capture_interval_secs),
            retry: RetryPolicy {
                attempts: section.publish_attempts,
                delay: Duration::from_millis(section.retry_delay_ms),
                timeout: Duration::from_millis(section.publish_timeout_ms),
                retry_unconfirmed: true,
            },
        }
    }

    pub fn client_id(&self) -> String {
        sensor_client_id(self.sensor_id)
    }
}

pub fn sensor_client_id(sensor_id: u32) -> String {
    format!("sensor_{sensor_id}")
}

/// Transport options for a sensor node
///
/// Overrides the configured client id with `sensor_<id>`, registers the
/// retained `offline` last will and subscribes to capture commands.
pub fn sensor_transport_options(config: &TechTempConfig) -> Result<TransportOptions, TransportError> {
    let sensor = config
        .sensor()
        .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

    let mut options = TransportOptions::from_section(&config.mqtt)
        .with_last_will(LastWill::sensor_offline(sensor.sensor_id)?)
        .with_subscription(COMMAND_TOPIC, QoS::AtLeastOnce);
    options.client_id = sensor_client_id(sensor.sensor_id);
    options.validate()?;
    Ok(options)
}

/// Turns matching capture commands into capture requests
///
/// Requests coalesce: several commands arriving before the loop gets to
/// them produce one on-demand capture.
pub struct CommandListener {
    sensor_id: u32,
    capture_requested: Arc<Notify>,
}

impl CommandListener {
    /// Whether `command` asks this node for a capture
    pub fn accepts(&self, command: &Command) -> bool {
        command.action == CommandAction::Capture && command.sensor_id.matches(self.sensor_id)
    }
}

#[async_trait]
impl TransportHandler for CommandListener {
    async fn on_message(&self, message: InboundMessage) {
        if message.topic != COMMAND_TOPIC {
            debug!(topic = %message.topic, "Ignoring message outside the command topic");
            return;
        }

        match serde_json::from_slice::<Command>(&message.payload) {
            Ok(command) if self.accepts(&command) => {
                info!(sensor_id = self.sensor_id, "Capture requested");
                self.capture_requested.notify_one();
            }
            Ok(command) => {
                debug!(sensor_id = self.sensor_id, command_target = ?command.sensor_id, "Command for another sensor");
            }
            Err(e) => warn!(error = %e, "Dropping malformed command"),
        }
    }

    async fn on_connection_lost(&self, reason: &str) {
        warn!(sensor_id = self.sensor_id, reason = %reason, "Broker connection lost");
    }
}

/// Sensor node
pub struct SensorNode {
    settings: SensorSettings,
    transport: Arc<dyn Transport>,
    source: Arc<dyn ReadingSource>,
    capture_requested: Arc<Notify>,
}

impl SensorNode {
    pub fn new(
        settings: SensorSettings,
        transport: Arc<dyn Transport>,
        source: Arc<dyn ReadingSource>,
    ) -> Self {
        Self {
            settings,
            transport,
            source,
            capture_requested: Arc::new(Notify::new()),
        }
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    /// Handler to install on the transport
    pub fn command_listener(&self) -> CommandListener {
        CommandListener {
            sensor_id: self.settings.sensor_id,
            capture_requested: self.capture_requested.clone(),
        }
    }

    /// Publish a retained presence message
    ///
    /// `online` gets the bounded retry loop; `offline` is a single attempt
    /// since the process is on its way out.
    pub async fn announce(&self, presence: Presence) -> PublishOutcome {
        let message = match presence {
            Presence::Online => StatusMessage::online(self.settings.sensor_id),
            Presence::Offline => StatusMessage::offline(self.settings.sensor_id),
        };
        let payload = match encode_payload(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode status message");
                return PublishOutcome::Error;
            }
        };
        let policy = match presence {
            Presence::Online => RetryPolicy {
                timeout: STATUS_TIMEOUT,
                ..RetryPolicy::default()
            },
            Presence::Offline => RetryPolicy::single(STATUS_TIMEOUT),
        };

        let outcome = publish_with_retry(
            self.transport.as_ref(),
            STATUS_TOPIC,
            &payload,
            QoS::AtLeastOnce,
            true,
            &policy,
        )
        .await;
        info!(sensor_id = self.settings.sensor_id, presence = ?presence, outcome = %outcome, "Presence announced");
        outcome
    }

    /// Read the sensor and publish the reading
    pub async fn capture(&self, trigger: CaptureTrigger) -> Result<Telemetry, SensorError> {
        let reading = self.source.read().await?;
        let telemetry = Telemetry {
            sensor_id: self.settings.sensor_id,
            room_id: self.settings.room_id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            trigger: Some(trigger),
        };
        let payload = encode_payload(&telemetry)?;

        let outcome = publish_with_retry(
            self.transport.as_ref(),
            WEATHER_TOPIC,
            &payload,
            QoS::AtLeastOnce,
            false,
            &self.settings.retry,
        )
        .await;

        if outcome != PublishOutcome::Ok {
            return Err(SensorError::NotDelivered(outcome));
        }
        info!(
            sensor_id = telemetry.sensor_id,
            trigger = trigger.as_str(),
            temperature = telemetry.temperature,
            humidity = telemetry.humidity,
            "Reading sent"
        );
        Ok(telemetry)
    }

    /// Run until `shutdown` flips to true or a scheduled capture fails
    ///
    /// The first scheduled capture happens immediately. On the way out the
    /// node announces `offline` and cleans up the transport, whatever the
    /// reason for stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SensorError> {
        info!(
            sensor_id = self.settings.sensor_id,
            room_id = self.settings.room_id,
            interval_secs = self.settings.capture_interval.as_secs(),
            "Sensor node starting"
        );
        self.announce(Presence::Online).await;

        let mut schedule = tokio::time::interval(self.settings.capture_interval);
        schedule.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = schedule.tick() => {
                    if let Err(e) = self.capture(CaptureTrigger::Scheduled).await {
                        error!(sensor_id = self.settings.sensor_id, error = %e, "Scheduled capture failed, stopping");
                        break Err(e);
                    }
                }
                _ = self.capture_requested.notified() => {
                    if let Err(e) = self.capture(CaptureTrigger::OnDemand).await {
                        warn!(sensor_id = self.settings.sensor_id, error = %e, "On-demand capture failed");
                    }
                }
            }
        };

        self.announce(Presence::Offline).await;
        self.transport.cleanup().await;
        info!(sensor_id = self.settings.sensor_id, "Sensor node stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandTarget;
    use crate::testing::mocks::{MockTransport, PublishedMessage};
    use serde_json::json;

    fn settings(interval: Duration) -> SensorSettings {
        SensorSettings {
            sensor_id: 7,
            room_id: 2,
            capture_interval: interval,
            retry: RetryPolicy {
                delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
        }
    }

    fn node(transport: Arc<MockTransport>, interval: Duration) -> SensorNode {
        SensorNode::new(
            settings(interval),
            transport,
            Arc::new(SimulatedSource::default()),
        )
    }

    async fn wait_for_topic(
        transport: &MockTransport,
        topic: &str,
        count: usize,
    ) -> Vec<PublishedMessage> {
        for _ in 0..200 {
            let messages = transport.published_to(topic).await;
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.published_to(topic).await
    }

    fn command(target: serde_json::Value) -> InboundMessage {
        InboundMessage {
            topic: COMMAND_TOPIC.to_string(),
            payload: serde_json::to_vec(&json!({"action": "capture", "sensor_id": target})).unwrap(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl ReadingSource for BrokenSource {
        async fn read(&self) -> Result<Reading, SourceError> {
            Err(SourceError::ReadFailed("i2c timeout".to_string()))
        }
    }

    #[tokio::test]
    async fn test_capture_publishes_telemetry() {
        let transport = Arc::new(MockTransport::new());
        let node = node(transport.clone(), Duration::from_secs(300));

        let telemetry = node.capture(CaptureTrigger::Scheduled).await.unwrap();
        assert_eq!(telemetry.sensor_id, 7);
        assert_eq!(telemetry.room_id, 2);

        let published = transport.published_to(WEATHER_TOPIC).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert!(!published[0].retain);
        let body = published[0].json();
        assert_eq!(body["sensor_id"], json!(7));
        assert_eq!(body["room_id"], json!(2));
        assert_eq!(body["trigger"], json!("scheduled"));
        assert!(body["humidity"].is_u64());
    }

    #[tokio::test]
    async fn test_capture_retries_then_gives_up() {
        let transport = Arc::new(MockTransport::new());
        transport
            .script_outcomes(vec![PublishOutcome::RetryLater; 5])
            .await;
        let node = node(transport.clone(), Duration::from_secs(300));

        let result = node.capture(CaptureTrigger::Scheduled).await;
        assert!(matches!(
            result,
            Err(SensorError::NotDelivered(PublishOutcome::RetryLater))
        ));
        assert_eq!(transport.published().await.len(), 5);
    }

    #[tokio::test]
    async fn test_source_failure_publishes_nothing() {
        let transport = Arc::new(MockTransport::new());
        let node = SensorNode::new(
            settings(Duration::from_secs(300)),
            transport.clone(),
            Arc::new(BrokenSource),
        );

        let result = node.capture(CaptureTrigger::OnDemand).await;
        assert!(matches!(result, Err(SensorError::Source(_))));
        assert!(transport.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let transport = Arc::new(MockTransport::new());
        let node = Arc::new(node(transport.clone(), Duration::from_secs(3600)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let node = node.clone();
            tokio::spawn(async move { node.run(shutdown_rx).await })
        };

        // First scheduled capture is immediate
        let readings = wait_for_topic(&transport, WEATHER_TOPIC, 1).await;
        assert_eq!(readings[0].json()["trigger"], json!("scheduled"));

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        let statuses = transport.published_to(STATUS_TOPIC).await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|m| m.retain && m.qos == QoS::AtLeastOnce));
        assert_eq!(statuses[0].json(), json!({"sensor_id": 7, "status": "online"}));
        assert_eq!(statuses[1].json(), json!({"sensor_id": 7, "status": "offline"}));
        assert_eq!(transport.cleanup_calls(), 1);
    }

    #[tokio::test]
    async fn test_matching_command_triggers_on_demand_capture() {
        let transport = Arc::new(MockTransport::new());
        let node = Arc::new(node(transport.clone(), Duration::from_secs(3600)));
        let listener = node.command_listener();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let node = node.clone();
            tokio::spawn(async move { node.run(shutdown_rx).await })
        };
        wait_for_topic(&transport, WEATHER_TOPIC, 1).await;

        listener.on_message(command(json!(8))).await;
        listener.on_message(command(json!(7))).await;
        let readings = wait_for_topic(&transport, WEATHER_TOPIC, 2).await;
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].json()["trigger"], json!("on-demand"));

        listener.on_message(command(json!("all"))).await;
        let readings = wait_for_topic(&transport, WEATHER_TOPIC, 3).await;
        assert_eq!(readings.len(), 3);

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_scheduled_capture_stops_node() {
        let transport = Arc::new(MockTransport::new());
        // Online announcement succeeds, the first reading fails permanently
        transport
            .script_outcomes(vec![PublishOutcome::Ok, PublishOutcome::Error])
            .await;
        let node = node(transport.clone(), Duration::from_secs(3600));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = node.run(shutdown_rx).await;

        assert!(matches!(
            result,
            Err(SensorError::NotDelivered(PublishOutcome::Error))
        ));
        let statuses = transport.published_to(STATUS_TOPIC).await;
        assert_eq!(statuses.last().unwrap().json()["status"], json!("offline"));
        assert_eq!(transport.cleanup_calls(), 1);
    }

    #[test]
    fn test_listener_accepts() {
        let listener = CommandListener {
            sensor_id: 7,
            capture_requested: Arc::new(Notify::new()),
        };
        assert!(listener.accepts(&Command::capture(CommandTarget::All)));
        assert!(listener.accepts(&Command::capture(CommandTarget::Sensor(7))));
        assert!(!listener.accepts(&Command::capture(CommandTarget::Sensor(3))));
    }

    #[test]
    fn test_sensor_transport_options() {
        let config = TechTempConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "tcp://192.168.1.10:1883"
client_id = "ignored"

[sensor]
sensor_id = 7
room_id = 2
"#,
        )
        .unwrap();

        let options = sensor_transport_options(&config).unwrap();
        assert_eq!(options.client_id, "sensor_7");
        let will = options.last_will.unwrap();
        assert_eq!(will.topic, STATUS_TOPIC);
        assert!(will.retain);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&will.payload).unwrap(),
            json!({"sensor_id": 7, "status": "offline"})
        );
        assert_eq!(options.subscriptions[0].filter, COMMAND_TOPIC);
    }

    #[test]
    fn test_sensor_options_require_sensor_section() {
        let config = TechTempConfig::test_config();
        assert!(matches!(
            sensor_transport_options(&config),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_source_is_plausible() {
        let source = SimulatedSource::default();
        for _ in 0..50 {
            let reading = source.read().await.unwrap();
            assert!((19.0..=23.0).contains(&reading.temperature));
            assert!((0.0..=100.0).contains(&reading.humidity));
            assert_eq!(reading.humidity.fract(), 0.0);
        }
    }
}
