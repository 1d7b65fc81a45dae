//! Transport layer for sensor telemetry and commands
//!
//! This module provides the transport abstraction used by the server and
//! sensor nodes, and the MQTT implementation behind it.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub mod mqtt;
pub mod retry;

pub use mqtt::{ConnectionState, TransportError};
pub use rumqttc::QoS;

/// Result of a publish call, classified at handoff time
///
/// None of these is a crash: `RetryLater` asks the caller to back off and
/// try again, `Timeout` means the broker has not confirmed yet (the message
/// may still arrive), and `Error` means the identical call will never work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Ok,
    Timeout,
    RetryLater,
    Error,
}

impl PublishOutcome {
    /// Whether a caller-side retry loop should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishOutcome::Timeout | PublishOutcome::RetryLater)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOutcome::Ok => "ok",
            PublishOutcome::Timeout => "timeout",
            PublishOutcome::RetryLater => "retry_later",
            PublishOutcome::Error => "error",
        }
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle for a QoS 1/2 publish awaiting broker acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryToken(pub(crate) u64);

impl DeliveryToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Events the transport hands to its dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    ConnectionLost(String),
    Delivered(DeliveryToken),
}

/// Receiver of transport events
///
/// Handlers run on a dedicated dispatcher task fed by a bounded queue.
/// A slow handler delays later events and, once the queue is full, loses
/// new ones with a warning; it never stalls the network pump.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn on_message(&self, _message: InboundMessage) {}

    async fn on_connection_lost(&self, _reason: &str) {}

    async fn on_delivered(&self, _token: DeliveryToken) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl TransportHandler for NoopHandler {}

/// Transport trait for telemetry and command traffic
///
/// This trait provides an abstraction over the broker connection so the
/// HTTP layer and the sensor loop can be exercised against mocks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload and classify the outcome
    ///
    /// At QoS 0 this returns as soon as the request is queued locally.
    /// At QoS 1/2 it waits up to `timeout` for the broker acknowledgment.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> PublishOutcome;

    /// Subscribe to a topic filter; remembered and re-issued on reconnect
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Drop a topic filter from the subscription set
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Stop background work and disconnect; safe to call repeatedly
    async fn cleanup(&self);
}

/// Type alias for MQTT transport
pub type DefaultTransport = mqtt::MqttTransport;
