//! Pure health monitoring and reconnection logic for the MQTT transport
//!
//! This module contains pure functions for reconnection decisions,
//! connection state transitions and publish admission.

use super::connection::{ConnectionState, ReconnectConfig};
use crate::transport::PublishOutcome;
use rumqttc::QoS;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    ///
    /// Retries are unlimited while automatic reconnection is enabled.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !config.enabled {
            return ReconnectionDecision::AbortReconnectDisabled;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted | ConnectionEvent::ReconnectionStarted(_) => {
                ConnectionState::Connecting
            }
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker
            | ConnectionEvent::NetworkError(_)
            | ConnectionEvent::ClientShutdown => ConnectionState::Disconnected,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Classify a publish before it is handed to the client (pure function)
    ///
    /// Returns the outcome to report immediately, or `None` when the publish
    /// may proceed. The in-flight limit only applies to acknowledged QoS.
    pub fn admit_publish(
        state: ConnectionState,
        qos: QoS,
        outstanding: usize,
        max_inflight: u16,
    ) -> Option<PublishOutcome> {
        if !Self::can_publish(state) {
            return Some(PublishOutcome::RetryLater);
        }
        if qos != QoS::AtMostOnce && outstanding >= usize::from(max_inflight) {
            return Some(PublishOutcome::RetryLater);
        }
        None
    }

    /// Whether an outstanding publish may be dropped from bookkeeping
    pub fn is_abandoned(waiter_gone: bool, age: Duration, max_age: Duration) -> bool {
        waiter_gone && age > max_age
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(target: "mqtt_transport", "MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => match event {
                ConnectionEvent::ClientShutdown => {
                    info!(target: "mqtt_transport", "MQTT connection closed by client");
                }
                ConnectionEvent::NetworkError(reason) => {
                    warn!(target: "mqtt_transport", reason = %reason, "MQTT connection lost");
                }
                ConnectionEvent::DisconnectedByBroker => {
                    warn!(target: "mqtt_transport", "MQTT connection closed by broker");
                }
                _ => warn!(target: "mqtt_transport", "MQTT connection lost: {:?}", event),
            },
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                if let ConnectionEvent::NetworkError(reason) = event {
                    error!(target: "mqtt_transport", reason = %reason, "MQTT connect attempt failed");
                }
            }
            (ConnectionState::Disconnected, ConnectionState::Connecting) => {
                if let ConnectionEvent::ReconnectionStarted(attempt) = event {
                    info!(target: "mqtt_transport", attempt, "Starting reconnection attempt");
                }
            }
            _ => {
                tracing::debug!(target: "mqtt_transport", "MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after the delay
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - automatic reconnection is off
    AbortReconnectDisabled,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Initial connect requested
    ConnectStarted,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Client requested the disconnect
    ClientShutdown,
}
