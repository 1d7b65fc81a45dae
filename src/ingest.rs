//! Telemetry ingestion
//!
//! [`IngestionBridge`] is the server's [`TransportHandler`]. It decodes
//! payloads arriving on the weather topics, feeds readings into the
//! [`LivenessMonitor`] and hands a copy of each reading to a
//! [`ReadingSink`]. Bad payloads are logged and dropped; nothing here can
//! take the process down.

use crate::monitor::{LivenessMonitor, MonitorError, UpdateOutcome};
use crate::protocol::{StatusMessage, Telemetry, STATUS_TOPIC, WEATHER_TOPIC};
use crate::transport::{DeliveryToken, InboundMessage, TransportHandler};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Payload could not be turned into a message
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No decoder for topic '{0}'")]
    UnknownTopic(String),
}

/// Persistence failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Reading as handed to storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub sensor_id: u32,
    pub room_id: u32,
    pub temperature: f64,
    pub humidity: f64,
    /// RFC 3339, UTC
    pub timestamp: String,
}

impl StoredReading {
    pub fn from_telemetry(reading: &Telemetry, received_at: DateTime<Utc>) -> Self {
        Self {
            sensor_id: reading.sensor_id,
            room_id: reading.room_id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Where decoded readings are persisted
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn store(&self, reading: &StoredReading) -> Result<(), SinkError>;
}

/// Sink that only logs; used when no database is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl ReadingSink for LoggingSink {
    async fn store(&self, reading: &StoredReading) -> Result<(), SinkError> {
        info!(
            sensor_id = reading.sensor_id,
            room_id = reading.room_id,
            temperature = reading.temperature,
            humidity = reading.humidity,
            timestamp = %reading.timestamp,
            "Reading stored"
        );
        Ok(())
    }
}

/// Bridges transport events into the monitor and the sink
pub struct IngestionBridge {
    monitor: Arc<LivenessMonitor>,
    sink: Arc<dyn ReadingSink>,
}

impl IngestionBridge {
    pub fn new(monitor: Arc<LivenessMonitor>, sink: Arc<dyn ReadingSink>) -> Self {
        Self { monitor, sink }
    }

    pub fn with_logging_sink(monitor: Arc<LivenessMonitor>) -> Self {
        Self::new(monitor, Arc::new(LoggingSink))
    }

    /// Decode a telemetry payload, persist it and update liveness
    ///
    /// A sink failure is logged and does not stop the monitor update.
    pub async fn handle_telemetry(&self, payload: &[u8]) -> Result<UpdateOutcome, IngestError> {
        let reading: Telemetry = serde_json::from_slice(payload).map_err(DecodeError::from)?;

        debug!(
            sensor_id = reading.sensor_id,
            room_id = reading.room_id,
            trigger = reading.trigger.map(|t| t.as_str()).unwrap_or("unspecified"),
            "Telemetry received"
        );

        let stored = StoredReading::from_telemetry(&reading, self.monitor.now());
        if let Err(e) = self.sink.store(&stored).await {
            warn!(sensor_id = reading.sensor_id, error = %e, "Failed to store reading");
        }

        let outcome = self
            .monitor
            .update(
                reading.sensor_id,
                reading.room_id,
                reading.temperature,
                reading.humidity,
            )
            .await?;
        Ok(outcome)
    }

    /// Record a node's presence announcement
    pub async fn handle_status(&self, payload: &[u8]) -> Result<bool, IngestError> {
        let status: StatusMessage = serde_json::from_slice(payload).map_err(DecodeError::from)?;
        let known = self
            .monitor
            .record_presence(status.sensor_id, status.status)
            .await?;
        if known {
            info!(sensor_id = status.sensor_id, presence = ?status.status, "Sensor presence announced");
        } else {
            debug!(sensor_id = status.sensor_id, "Presence for unregistered sensor ignored");
        }
        Ok(known)
    }

    pub async fn ingest(&self, message: &InboundMessage) -> Result<(), IngestError> {
        match message.topic.as_str() {
            WEATHER_TOPIC => self.handle_telemetry(&message.payload).await.map(|_| ()),
            STATUS_TOPIC => self.handle_status(&message.payload).await.map(|_| ()),
            other => Err(DecodeError::UnknownTopic(other.to_string()).into()),
        }
    }
}

#[async_trait]
impl TransportHandler for IngestionBridge {
    async fn on_message(&self, message: InboundMessage) {
        match self.ingest(&message).await {
            Ok(()) => {}
            Err(IngestError::Decode(e)) => {
                warn!(topic = %message.topic, error = %e, "Dropping undecodable message");
            }
            Err(IngestError::Monitor(e)) => {
                error!(topic = %message.topic, error = %e, "Monitor rejected reading");
            }
        }
    }

    async fn on_connection_lost(&self, reason: &str) {
        warn!(reason = %reason, "Broker connection lost, waiting for reconnection");
    }

    async fn on_delivered(&self, token: DeliveryToken) {
        debug!(token = %token, "Delivery confirmed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{DeviceStatus, ManualClock, MonitorSettings};
    use crate::protocol::Presence;
    use crate::testing::mocks::RecordingSink;
    use crate::transport::QoS;

    async fn bridge() -> (IngestionBridge, Arc<LivenessMonitor>, Arc<RecordingSink>) {
        let monitor = Arc::new(LivenessMonitor::new(
            MonitorSettings::default(),
            Arc::new(ManualClock::starting_now()),
        ));
        monitor.init().await;
        let sink = Arc::new(RecordingSink::new());
        (
            IngestionBridge::new(monitor.clone(), sink.clone()),
            monitor,
            sink,
        )
    }

    fn message(topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[tokio::test]
    async fn test_telemetry_updates_monitor_and_sink() {
        let (bridge, monitor, sink) = bridge().await;

        bridge
            .on_message(message(
                "weather",
                br#"{"sensor_id":7,"room_id":2,"temperature":21.5,"humidity":55}"#,
            ))
            .await;

        let health = monitor.snapshot().await.unwrap();
        assert_eq!(health.devices.len(), 1);
        assert_eq!(health.device(7).unwrap().status, DeviceStatus::Online);
        assert_eq!(health.device(7).unwrap().last_temperature, 21.5);

        let stored = sink.stored().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sensor_id, 7);
        assert_eq!(stored[0].humidity, 55.0);
        assert!(stored[0].timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_malformed_telemetry_is_dropped() {
        let (bridge, monitor, sink) = bridge().await;

        let result = bridge.handle_telemetry(b"{not json").await;
        assert!(matches!(result, Err(IngestError::Decode(DecodeError::Json(_)))));

        bridge.on_message(message("weather", br#"{"sensor_id":"x"}"#)).await;

        assert_eq!(monitor.device_count().await, Ok(0));
        assert!(sink.stored().await.is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_monitor() {
        let (_, monitor, _) = bridge().await;
        let bridge = IngestionBridge::new(monitor.clone(), Arc::new(RecordingSink::failing()));

        let outcome = bridge
            .handle_telemetry(br#"{"sensor_id":1,"room_id":1,"temperature":20.0,"humidity":40}"#)
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Registered);
        assert_eq!(monitor.device_count().await, Ok(1));
    }

    #[tokio::test]
    async fn test_status_records_presence_for_known_device() {
        let (bridge, monitor, _) = bridge().await;

        assert!(!bridge
            .handle_status(br#"{"sensor_id":7,"status":"online"}"#)
            .await
            .unwrap());

        bridge
            .handle_telemetry(br#"{"sensor_id":7,"room_id":2,"temperature":21.5,"humidity":55}"#)
            .await
            .unwrap();
        bridge
            .on_message(message("weather/status", br#"{"sensor_id":7,"status":"offline"}"#))
            .await;

        let health = monitor.snapshot().await.unwrap();
        let device = health.device(7).unwrap();
        assert_eq!(device.announced, Some(Presence::Offline));
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_rejected() {
        let (bridge, _, _) = bridge().await;
        let result = bridge.ingest(&message("weather/other", b"{}")).await;
        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::UnknownTopic(topic))) if topic == "weather/other"
        ));
    }

    #[tokio::test]
    async fn test_uninitialized_monitor_surfaces_error() {
        let (bridge, monitor, _) = bridge().await;
        monitor.cleanup().await;

        let result = bridge
            .handle_telemetry(br#"{"sensor_id":1,"room_id":1,"temperature":20.0,"humidity":40}"#)
            .await;
        assert!(matches!(
            result,
            Err(IngestError::Monitor(MonitorError::NotInitialized))
        ));
    }

    #[test]
    fn test_stored_reading_timestamp_format() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let reading = Telemetry {
            sensor_id: 4,
            room_id: 4,
            temperature: 18.25,
            humidity: 61.0,
            trigger: None,
        };
        let stored = StoredReading::from_telemetry(&reading, at);
        assert_eq!(stored.timestamp, "2024-03-01T12:30:05Z");
    }
}
