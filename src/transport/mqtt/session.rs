//! Connection record shared by callers and the pump
//!
//! Holds the connection state, the subscription set and the outstanding
//! QoS 1/2 publishes. The client keeps one [`Session`] behind a single
//! mutex; every mutation (publish handoff, acknowledgment, teardown) goes
//! through it.
//!
//! Packet ids are assigned inside the event loop, after the publish call
//! has returned. Registrations are therefore queued in handoff order and
//! bound to a packet id when the matching `Outgoing::Publish` event is
//! seen. Handoff and registration happen under the same lock, and the
//! event loop emits outgoing publishes in request order, so the queue and
//! the wire stay aligned.

use super::connection::{ConnectionState, Subscription};
use super::health_monitor::{ConnectionEvent, HealthMonitor};
use crate::transport::DeliveryToken;
use rumqttc::QoS;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// How an outstanding publish was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckResult {
    Acked,
    Disconnected,
}

#[derive(Debug)]
struct PendingPublish {
    token: DeliveryToken,
    topic: String,
    waiter: Option<oneshot::Sender<AckResult>>,
    registered_at: Instant,
}

impl PendingPublish {
    fn resolve(mut self, result: AckResult) -> DeliveryToken {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
        self.token
    }

    fn waiter_gone(&self) -> bool {
        self.waiter.as_ref().map_or(true, |waiter| waiter.is_closed())
    }
}

/// State of the single broker connection
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Vec<Subscription>,
    /// Handed off but not yet written; `None` for QoS 0
    awaiting_packet_id: VecDeque<Option<PendingPublish>>,
    pending: HashMap<u16, PendingPublish>,
    next_token: u64,
}

impl Session {
    pub fn new(subscriptions: Vec<Subscription>) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let session = Self {
            state: ConnectionState::Disconnected,
            state_tx,
            subscriptions,
            awaiting_packet_id: VecDeque::new(),
            pending: HashMap::new(),
            next_token: 1,
        };
        (session, state_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply a connection event and broadcast the new state
    pub fn transition(&mut self, event: ConnectionEvent) -> ConnectionState {
        let previous = self.state;
        let next = HealthMonitor::determine_next_state(&event);
        if previous != next {
            HealthMonitor::log_state_transition(previous, next, &event);
            self.state = next;
            let _ = self.state_tx.send(next);
        }
        previous
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Add or update a filter in the set re-issued on every ConnAck
    pub fn remember_subscription(&mut self, filter: &str, qos: QoS) {
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => existing.qos = qos,
            None => self.subscriptions.push(Subscription::new(filter, qos)),
        }
    }

    pub fn forget_subscription(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.filter != filter);
        before != self.subscriptions.len()
    }

    /// QoS 1/2 publishes handed off and not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.awaiting_packet_id.iter().flatten().count()
    }

    /// Record a publish that was just handed to the client
    ///
    /// Returns the token and acknowledgment receiver for QoS 1/2.
    pub(crate) fn register_publish(
        &mut self,
        topic: &str,
        qos: QoS,
    ) -> Option<(DeliveryToken, oneshot::Receiver<AckResult>)> {
        if qos == QoS::AtMostOnce {
            self.awaiting_packet_id.push_back(None);
            return None;
        }

        let token = DeliveryToken(self.next_token);
        self.next_token += 1;

        let (waiter, ack_rx) = oneshot::channel();
        self.awaiting_packet_id.push_back(Some(PendingPublish {
            token,
            topic: topic.to_string(),
            waiter: Some(waiter),
            registered_at: Instant::now(),
        }));
        Some((token, ack_rx))
    }

    /// Bind the oldest handed-off publish to the packet id the client assigned
    pub fn on_publish_sent(&mut self, packet_id: u16) {
        match self.awaiting_packet_id.pop_front() {
            Some(Some(entry)) if packet_id != 0 => {
                debug!(
                    target: "mqtt_transport",
                    token = %entry.token,
                    packet_id,
                    topic = %entry.topic,
                    "Publish written"
                );
                if let Some(replaced) = self.pending.insert(packet_id, entry) {
                    // Packet id reuse means the broker never acknowledged the old one
                    replaced.resolve(AckResult::Disconnected);
                }
            }
            Some(Some(entry)) => {
                debug!(target: "mqtt_transport", token = %entry.token, "Tracked publish written without packet id");
                entry.resolve(AckResult::Acked);
            }
            Some(None) => {}
            None => {
                debug!(target: "mqtt_transport", packet_id, "Untracked publish written (replay)");
            }
        }
    }

    /// Complete an outstanding publish; returns its token if it was tracked
    pub fn on_acknowledged(&mut self, packet_id: u16) -> Option<DeliveryToken> {
        self.pending
            .remove(&packet_id)
            .map(|entry| entry.resolve(AckResult::Acked))
    }

    /// Resolve every outstanding publish as undeliverable on this connection
    pub fn fail_all(&mut self) -> usize {
        let mut failed = 0;
        for entry in self.awaiting_packet_id.drain(..).flatten() {
            entry.resolve(AckResult::Disconnected);
            failed += 1;
        }
        for (_, entry) in self.pending.drain() {
            entry.resolve(AckResult::Disconnected);
            failed += 1;
        }
        failed
    }

    /// Drop acknowledged-never entries nobody is waiting for anymore
    pub fn reap_abandoned(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| {
            let age = now.saturating_duration_since(entry.registered_at);
            !HealthMonitor::is_abandoned(entry.waiter_gone(), age, max_age)
        });
        before - self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_session() -> Session {
        let (mut session, _rx) = Session::new(Vec::new());
        session.transition(ConnectionEvent::ConnectStarted);
        session.transition(ConnectionEvent::ConnAckReceived);
        session
    }

    #[test]
    fn test_transition_broadcasts_state() {
        let (mut session, rx) = Session::new(Vec::new());
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);

        session.transition(ConnectionEvent::ConnectStarted);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        let previous = session.transition(ConnectionEvent::ConnAckReceived);
        assert_eq!(previous, ConnectionState::Connecting);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_subscription_set_is_idempotent() {
        let (mut session, _rx) = Session::new(vec![Subscription::new("weather", QoS::AtLeastOnce)]);

        session.remember_subscription("weather", QoS::AtMostOnce);
        session.remember_subscription("weather/status", QoS::AtLeastOnce);
        assert_eq!(session.subscriptions().len(), 2);
        assert_eq!(session.subscriptions()[0].qos, QoS::AtMostOnce);

        assert!(session.forget_subscription("weather"));
        assert!(!session.forget_subscription("weather"));
        assert_eq!(session.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_resolves_waiter() {
        let mut session = connected_session();

        let (token, ack_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();
        assert_eq!(session.outstanding(), 1);

        session.on_publish_sent(1);
        assert_eq!(session.outstanding(), 1);

        assert_eq!(session.on_acknowledged(1), Some(token));
        assert_eq!(session.outstanding(), 0);
        assert_eq!(ack_rx.await.unwrap(), AckResult::Acked);
    }

    #[test]
    fn test_qos0_is_not_tracked() {
        let mut session = connected_session();
        assert!(session.register_publish("weather", QoS::AtMostOnce).is_none());
        assert_eq!(session.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_packet_ids_bind_in_handoff_order() {
        let mut session = connected_session();

        let (first, first_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();
        assert!(session.register_publish("weather", QoS::AtMostOnce).is_none());
        let (second, second_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();

        session.on_publish_sent(5);
        session.on_publish_sent(0);
        session.on_publish_sent(6);

        assert_eq!(session.on_acknowledged(6), Some(second));
        assert_eq!(session.on_acknowledged(5), Some(first));
        assert_eq!(first_rx.await.unwrap(), AckResult::Acked);
        assert_eq!(second_rx.await.unwrap(), AckResult::Acked);
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut session = connected_session();
        session.on_publish_sent(3);
        assert_eq!(session.on_acknowledged(42), None);
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_waiter() {
        let mut session = connected_session();

        let (_, queued_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();
        let (_, sent_rx) = session.register_publish("weather", QoS::ExactlyOnce).unwrap();
        session.on_publish_sent(1);

        assert_eq!(session.fail_all(), 2);
        assert_eq!(session.outstanding(), 0);
        assert_eq!(queued_rx.await.unwrap(), AckResult::Disconnected);
        assert_eq!(sent_rx.await.unwrap(), AckResult::Disconnected);
    }

    #[test]
    fn test_reap_only_abandoned_and_old() {
        let mut session = connected_session();

        let (_, dropped_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();
        let (_, _kept_rx) = session.register_publish("weather", QoS::AtLeastOnce).unwrap();
        session.on_publish_sent(1);
        session.on_publish_sent(2);
        drop(dropped_rx);

        let max_age = Duration::from_secs(300);
        assert_eq!(session.reap_abandoned(Instant::now(), max_age), 0);

        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(session.reap_abandoned(later, max_age), 1);
        assert_eq!(session.outstanding(), 1);
    }
}
