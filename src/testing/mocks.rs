//! Mock implementations for testing
//!
//! Provides a mock Transport, a recording ReadingSink and a recording
//! TransportHandler so the HTTP layer, the sensor loop and ingestion can be
//! tested without a broker.

use crate::ingest::{ReadingSink, SinkError, StoredReading};
use crate::transport::{
    ConnectionState, DeliveryToken, InboundMessage, PublishOutcome, QoS, Transport,
    TransportError, TransportEvent, TransportHandler,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// One publish call as seen by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock transport for testing
///
/// Every publish is recorded. Outcomes come from the scripted queue first
/// and default to `Ok` (or `RetryLater` for a failing transport).
#[derive(Debug)]
pub struct MockTransport {
    published: Mutex<Vec<PublishedMessage>>,
    outcomes: Mutex<VecDeque<PublishOutcome>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    state: std::sync::Mutex<ConnectionState>,
    cleanups: AtomicUsize,
    should_fail: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            outcomes: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(Vec::new()),
            state: std::sync::Mutex::new(ConnectionState::Connected),
            cleanups: AtomicUsize::new(0),
            should_fail: false,
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disconnected transport whose publishes come back `RetryLater`
    pub fn with_failure() -> Self {
        Self {
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            should_fail: true,
            ..Default::default()
        }
    }

    /// Queue outcomes for the next publish calls
    pub async fn script_outcomes(&self, outcomes: Vec<PublishOutcome>) {
        self.outcomes.lock().await.extend(outcomes);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().await.clone()
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        _timeout: Duration,
    ) -> PublishOutcome {
        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });

        if let Some(outcome) = self.outcomes.lock().await.pop_front() {
            return outcome;
        }
        if self.should_fail {
            PublishOutcome::RetryLater
        } else {
            PublishOutcome::Ok
        }
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .await
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().await.retain(|(f, _)| f != filter);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.set_connection_state(ConnectionState::Disconnected);
    }
}

/// Sink that keeps every reading in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    stored: Mutex<Vec<StoredReading>>,
    should_fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn stored(&self) -> Vec<StoredReading> {
        self.stored.lock().await.clone()
    }
}

#[async_trait]
impl ReadingSink for RecordingSink {
    async fn store(&self, reading: &StoredReading) -> Result<(), SinkError> {
        if self.should_fail {
            return Err(SinkError::Unavailable("Mock storage failure".to_string()));
        }
        self.stored.lock().await.push(reading.clone());
        Ok(())
    }
}

/// Handler that records every event it receives
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().await.clone()
    }

    /// Poll until at least `count` events arrived or `within` elapsed
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<TransportEvent> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let events = self.events().await;
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TransportHandler for RecordingHandler {
    async fn on_message(&self, message: InboundMessage) {
        self.events.lock().await.push(TransportEvent::Message(message));
    }

    async fn on_connection_lost(&self, reason: &str) {
        self.events
            .lock()
            .await
            .push(TransportEvent::ConnectionLost(reason.to_string()));
    }

    async fn on_delivered(&self, token: DeliveryToken) {
        self.events.lock().await.push(TransportEvent::Delivered(token));
    }
}
