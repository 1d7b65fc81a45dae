//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and event loop: connecting,
//! pumping the event loop, publishing with acknowledgment tracking,
//! subscriptions and shutdown. Decisions are delegated to the pure
//! modules next to it.

use super::connection::{
    configure_mqtt_options, fits_packet, ConnectionState, ReconnectConfig, TransportError,
    TransportOptions,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use super::session::{AckResult, Session};
use crate::protocol::{validate_publish_topic, validate_topic_filter};
use crate::transport::{
    InboundMessage, PublishOutcome, Transport, TransportEvent, TransportHandler,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Outstanding publishes nobody waits for are forgotten after this long
const ABANDONED_PUBLISH_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Minimum time given to the event loop to flush the DISCONNECT packet
const DISCONNECT_FLUSH: Duration = Duration::from_millis(100);

/// Longest single wait on the event loop when pumping in the foreground
///
/// Network activity or a queued request ends the wait early.
const FOREGROUND_POLL_WAIT: Duration = Duration::from_secs(1);

/// Events queued for the handler before new ones are dropped
const HANDLER_QUEUE_CAPACITY: usize = 256;

/// Why the client refused a request
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkError {
    /// Request queue full
    Saturated,
    /// Event loop gone
    Closed,
}

impl From<ClientError> for SinkError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::TryRequest(_) => SinkError::Saturated,
            _ => SinkError::Closed,
        }
    }
}

/// Non-blocking request side of the client
///
/// None of these calls may wait: they run while the session lock is held.
pub(crate) trait RequestSink: Send + Sync {
    fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), SinkError>;

    fn try_subscribe(&self, filter: &str, qos: QoS) -> Result<(), SinkError>;

    fn try_unsubscribe(&self, filter: &str) -> Result<(), SinkError>;

    fn try_disconnect(&self) -> Result<(), SinkError>;
}

impl RequestSink for AsyncClient {
    fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), SinkError> {
        AsyncClient::try_publish(self, topic, qos, retain, payload).map_err(SinkError::from)
    }

    fn try_subscribe(&self, filter: &str, qos: QoS) -> Result<(), SinkError> {
        AsyncClient::try_subscribe(self, filter, qos).map_err(SinkError::from)
    }

    fn try_unsubscribe(&self, filter: &str) -> Result<(), SinkError> {
        AsyncClient::try_unsubscribe(self, filter).map_err(SinkError::from)
    }

    fn try_disconnect(&self) -> Result<(), SinkError> {
        AsyncClient::try_disconnect(self).map_err(SinkError::from)
    }
}

/// State reachable from both callers and the pump task
struct Shared {
    client_id: String,
    sink: Arc<dyn RequestSink>,
    session: Mutex<Session>,
    events: RwLock<Option<mpsc::Sender<TransportEvent>>>,
}

impl Shared {
    /// Queue an event for the handler without ever waiting on it
    async fn emit(&self, event: TransportEvent) {
        let Some(events) = self.events.read().await.clone() else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let kind = match event {
                    TransportEvent::Message(_) => "message",
                    TransportEvent::ConnectionLost(_) => "connection_lost",
                    TransportEvent::Delivered(_) => "delivered",
                };
                warn!(
                    target: "mqtt_transport",
                    kind,
                    capacity = HANDLER_QUEUE_CAPACITY,
                    "Handler queue full, event dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "mqtt_transport", "Event dispatcher gone, event dropped");
            }
        }
    }

    /// Act on one routed event
    async fn process_route(&self, route: EventRoute, reconnect_attempts: &mut u32) {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                let mut session = self.session.lock().await;
                session.transition(ConnectionEvent::ConnAckReceived);
                *reconnect_attempts = 0;
                info!(
                    target: "mqtt_transport",
                    client_id = %self.client_id,
                    session_present,
                    "Connected to MQTT broker"
                );
                self.resubscribe(&session);
            }
            EventRoute::ConnectionRefused(reason) => {
                error!(target: "mqtt_transport", reason = %reason, "Broker refused connection");
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                MessageHandler::log_inbound(&topic, &payload, retain);
                self.emit(TransportEvent::Message(InboundMessage {
                    topic,
                    payload,
                    qos,
                    retain,
                }))
                .await;
            }
            EventRoute::PublishSent { packet_id } => {
                self.session.lock().await.on_publish_sent(packet_id);
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                let token = self.session.lock().await.on_acknowledged(packet_id);
                if let Some(token) = token {
                    debug!(target: "mqtt_transport", token = %token, packet_id, "Delivery confirmed");
                    self.emit(TransportEvent::Delivered(token)).await;
                }
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                match MessageHandler::validate_subscription_success(&granted) {
                    Ok(()) => {
                        debug!(target: "mqtt_transport", packet_id, "Subscription confirmed: {:?}", granted);
                    }
                    Err(reason) => warn!(target: "mqtt_transport", packet_id, "{}", reason),
                }
            }
            EventRoute::Disconnected => {
                self.connection_closed(
                    ConnectionEvent::DisconnectedByBroker,
                    "Broker disconnected".to_string(),
                )
                .await;
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    /// Re-issue the whole subscription set; failures are logged only
    fn resubscribe(&self, session: &Session) {
        for subscription in session.subscriptions() {
            match self.sink.try_subscribe(&subscription.filter, subscription.qos) {
                Ok(()) => {
                    debug!(target: "mqtt_transport", filter = %subscription.filter, "Subscribed");
                }
                Err(e) => {
                    error!(
                        target: "mqtt_transport",
                        filter = %subscription.filter,
                        "Failed to subscribe: {:?}",
                        e
                    );
                }
            }
        }
    }

    /// Mark the connection down after a network or protocol error
    async fn connection_lost(&self, reason: String) {
        self.connection_closed(ConnectionEvent::NetworkError(reason.clone()), reason)
            .await;
    }

    /// Mark the connection down and fail everything still waiting on it
    async fn connection_closed(&self, event: ConnectionEvent, reason: String) {
        let (previous, failed) = {
            let mut session = self.session.lock().await;
            let previous = session.transition(event);
            (previous, session.fail_all())
        };

        if failed > 0 {
            warn!(target: "mqtt_transport", failed, "Outstanding publishes not confirmed before connection loss");
        }
        if previous == ConnectionState::Connected {
            self.emit(TransportEvent::ConnectionLost(reason)).await;
        }
    }

    async fn housekeeping(&self) {
        let reaped = self
            .session
            .lock()
            .await
            .reap_abandoned(Instant::now(), ABANDONED_PUBLISH_MAX_AGE);
        if reaped > 0 {
            debug!(target: "mqtt_transport", reaped, "Forgot unacknowledged publishes nobody waits for");
        }
    }
}

/// MQTT transport owning one broker connection
pub struct MqttTransport {
    options: TransportOptions,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    event_loop: Mutex<Option<EventLoop>>,
    shutdown_tx: watch::Sender<bool>,
    pump_handle: Mutex<Option<JoinHandle<EventLoop>>>,
    housekeeping_handle: Mutex<Option<JoinHandle<()>>>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
}

impl MqttTransport {
    /// Validate options and create the client; nothing touches the network yet
    pub fn new(options: TransportOptions) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(&options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);
        Ok(Self::from_parts(options, Arc::new(client), Some(event_loop)))
    }

    fn from_parts(
        options: TransportOptions,
        sink: Arc<dyn RequestSink>,
        event_loop: Option<EventLoop>,
    ) -> Self {
        let (session, state_rx) = Session::new(options.subscriptions.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                client_id: options.client_id.clone(),
                sink,
                session: Mutex::new(session),
                events: RwLock::new(None),
            }),
            options,
            state_rx,
            event_loop: Mutex::new(event_loop),
            shutdown_tx,
            pump_handle: Mutex::new(None),
            housekeeping_handle: Mutex::new(None),
            dispatcher_handle: Mutex::new(None),
            started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// Connect and wait for the broker's ConnAck
    ///
    /// Any failure here is final for this call: the caller decides whether
    /// to abort or try again. On success the initial subscriptions are
    /// issued and, if configured, the background pump is started.
    pub async fn connect(&self, handler: Arc<dyn TransportHandler>) -> Result<(), TransportError> {
        if self.cleaned_up.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(
                "transport has been cleaned up".to_string(),
            ));
        }
        if self.connection_state() != ConnectionState::Disconnected
            || self.started.load(Ordering::SeqCst)
        {
            return Err(TransportError::ConnectFailed("already connected".to_string()));
        }

        let mut event_loop = self.event_loop.lock().await.take().ok_or_else(|| {
            TransportError::ConnectFailed("event loop already started".to_string())
        })?;

        info!(
            target: "mqtt_transport",
            client_id = %self.options.client_id,
            broker = %self.options.broker_url,
            "Connecting to MQTT broker"
        );
        self.shared
            .session
            .lock()
            .await
            .transition(ConnectionEvent::ConnectStarted);
        self.start_dispatcher(handler).await;

        let outcome = tokio::time::timeout(
            self.options.connect_timeout,
            self.wait_for_connack(&mut event_loop),
        )
        .await
        .unwrap_or_else(|_| Err("ConnAck timeout - no connection confirmation received".to_string()));

        if let Err(reason) = outcome {
            self.shared
                .session
                .lock()
                .await
                .transition(ConnectionEvent::NetworkError(reason.clone()));
            self.stop_dispatcher().await;
            *self.event_loop.lock().await = Some(event_loop);
            return Err(TransportError::ConnectFailed(reason));
        }

        self.started.store(true, Ordering::SeqCst);

        if self.options.run_background_pump {
            self.start_pump(event_loop).await;
        } else {
            *self.event_loop.lock().await = Some(event_loop);
        }
        Ok(())
    }

    async fn wait_for_connack(&self, event_loop: &mut EventLoop) -> Result<(), String> {
        let mut attempts = 0u32;
        loop {
            let event = event_loop.poll().await.map_err(|e| e.to_string())?;
            let route = MessageHandler::route_mqtt_event(&event);
            if let EventRoute::ConnectionRefused(reason) = &route {
                return Err(format!("Broker refused connection: {reason}"));
            }
            let acknowledged = matches!(route, EventRoute::ConnectionAcknowledged { .. });
            self.shared.process_route(route, &mut attempts).await;
            if acknowledged {
                return Ok(());
            }
        }
    }

    async fn start_dispatcher(&self, handler: Arc<dyn TransportHandler>) {
        self.stop_dispatcher().await;

        let (events_tx, events_rx) = mpsc::channel(HANDLER_QUEUE_CAPACITY);
        *self.shared.events.write().await = Some(events_tx);
        let handle = tokio::spawn(run_dispatcher(handler, events_rx));
        *self.dispatcher_handle.lock().await = Some(handle);
    }

    /// Drop the event sender and let the dispatcher drain what is queued
    async fn stop_dispatcher(&self) {
        self.shared.events.write().await.take();
        if let Some(handle) = self.dispatcher_handle.lock().await.take() {
            match tokio::time::timeout(self.options.disconnect_grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "mqtt_transport", "Event dispatcher ended abnormally: {}", e),
                Err(_) => warn!(target: "mqtt_transport", "Event dispatcher still busy, detaching"),
            }
        }
    }

    async fn start_pump(&self, event_loop: EventLoop) {
        let pump = tokio::spawn(
            run_pump(
                self.shared.clone(),
                event_loop,
                self.options.reconnect.clone(),
                self.shutdown_tx.subscribe(),
            )
            .instrument(crate::mqtt_span!(client_id = %self.options.client_id)),
        );
        let housekeeping = tokio::spawn(run_housekeeping(
            self.shared.clone(),
            self.options.pump_interval,
            self.shutdown_tx.subscribe(),
        ));
        *self.pump_handle.lock().await = Some(pump);
        *self.housekeeping_handle.lock().await = Some(housekeeping);
    }

    /// Drive the event loop for one step when no background pump runs
    ///
    /// Waits at most `max_wait` for network activity.
    pub async fn pump_once(&self, max_wait: Duration) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) || self.cleaned_up.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected {
                state: self.connection_state(),
            });
        }

        let state = self.connection_state();
        if state == ConnectionState::Disconnected && !self.options.reconnect.enabled {
            return Err(TransportError::NotConnected { state });
        }

        let mut guard = self.event_loop.lock().await;
        let event_loop = guard.as_mut().ok_or_else(|| {
            TransportError::InvalidConfig("event loop is driven by the background pump".to_string())
        })?;

        self.shared.housekeeping().await;

        let mut attempts = 0u32;
        match tokio::time::timeout(max_wait, event_loop.poll()).await {
            Ok(Ok(event)) => {
                let route = MessageHandler::route_mqtt_event(&event);
                self.shared.process_route(route, &mut attempts).await;
            }
            Ok(Err(e)) => self.shared.connection_lost(e.to_string()).await,
            Err(_) => {}
        }
        Ok(())
    }

    /// Pump in the caller's task until the transport is cleaned up
    ///
    /// Foreground counterpart of the background pump for
    /// `run_background_pump = false`. One poll stays in flight for up to a
    /// second at a time; a lost connection is retried with the
    /// configured backoff. Returns once `cleanup` runs, so callers can keep
    /// publishing until then.
    pub async fn drive(&self) -> Result<(), TransportError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut reconnect_attempts = 0u32;

        loop {
            if self.cleaned_up.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                stepped = self.pump_once(FOREGROUND_POLL_WAIT) => stepped?,
            }

            match self.connection_state() {
                ConnectionState::Connected => reconnect_attempts = 0,
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected => {
                    let decision = HealthMonitor::should_attempt_reconnection(
                        reconnect_attempts,
                        &self.options.reconnect,
                        *shutdown_rx.borrow(),
                    );
                    match decision {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            reconnect_attempts = attempt;
                            info!(
                                target: "mqtt_transport",
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Reconnecting after delay"
                            );
                            if !interruptible_sleep(&mut shutdown_rx, delay).await {
                                return Ok(());
                            }
                            self.shared
                                .session
                                .lock()
                                .await
                                .transition(ConnectionEvent::ReconnectionStarted(attempt));
                        }
                        ReconnectionDecision::AbortShutdownRequested => return Ok(()),
                        ReconnectionDecision::AbortReconnectDisabled => {
                            return Err(TransportError::NotConnected {
                                state: ConnectionState::Disconnected,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Publish and classify the outcome
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> PublishOutcome {
        if let Err(e) = validate_publish_topic(topic) {
            warn!(target: "mqtt_transport", topic = %topic, "Publish rejected: {}", e);
            return PublishOutcome::Error;
        }
        if !fits_packet(topic, payload.len()) {
            warn!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Publish rejected: payload too large");
            return PublishOutcome::Error;
        }

        let registration = {
            let mut session = self.shared.session.lock().await;
            if let Some(outcome) = HealthMonitor::admit_publish(
                session.state(),
                qos,
                session.outstanding(),
                self.options.max_inflight,
            ) {
                debug!(target: "mqtt_transport", topic = %topic, state = %session.state(), "Publish deferred");
                return outcome;
            }

            match self.shared.sink.try_publish(topic, qos, retain, payload) {
                Ok(()) => session.register_publish(topic, qos),
                Err(e) => {
                    debug!(target: "mqtt_transport", topic = %topic, "Request queue unavailable: {:?}", e);
                    return PublishOutcome::RetryLater;
                }
            }
        };

        let Some((token, ack_rx)) = registration else {
            return PublishOutcome::Ok;
        };

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(AckResult::Acked)) => PublishOutcome::Ok,
            Ok(Ok(AckResult::Disconnected)) | Ok(Err(_)) => PublishOutcome::RetryLater,
            Err(_) => {
                debug!(target: "mqtt_transport", token = %token, topic = %topic, "Acknowledgment not received in time");
                PublishOutcome::Timeout
            }
        }
    }

    /// Add a filter to the subscription set and subscribe if connected
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        validate_topic_filter(filter).map_err(|e| TransportError::Subscription(e.to_string()))?;

        let mut session = self.shared.session.lock().await;
        session.remember_subscription(filter, qos);
        if session.state() != ConnectionState::Connected {
            debug!(target: "mqtt_transport", filter = %filter, "Subscription deferred until connected");
            return Ok(());
        }

        self.shared.sink.try_subscribe(filter, qos).map_err(|e| {
            warn!(target: "mqtt_transport", filter = %filter, "Subscribe failed: {:?}", e);
            TransportError::Subscription(format!("{e:?}"))
        })
    }

    /// Remove a filter from the subscription set and unsubscribe if connected
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        validate_topic_filter(filter).map_err(|e| TransportError::Subscription(e.to_string()))?;

        let mut session = self.shared.session.lock().await;
        if !session.forget_subscription(filter) {
            debug!(target: "mqtt_transport", filter = %filter, "Not subscribed");
        }
        if session.state() != ConnectionState::Connected {
            return Ok(());
        }

        self.shared.sink.try_unsubscribe(filter).map_err(|e| {
            warn!(target: "mqtt_transport", filter = %filter, "Unsubscribe failed: {:?}", e);
            TransportError::Subscription(format!("{e:?}"))
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Outstanding QoS 1/2 publishes
    pub async fn pending_count(&self) -> usize {
        self.shared.session.lock().await.outstanding()
    }

    /// Stop the pump, disconnect gracefully and drop the handler
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!(target: "mqtt_transport", "Transport already cleaned up");
            return;
        }

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.housekeeping_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "mqtt_transport", "Housekeeping task ended abnormally: {}", e);
            }
        }
        if let Some(handle) = self.pump_handle.lock().await.take() {
            match handle.await {
                Ok(event_loop) => *self.event_loop.lock().await = Some(event_loop),
                Err(e) => warn!(target: "mqtt_transport", "MQTT pump ended abnormally: {}", e),
            }
        }

        if self.connection_state() == ConnectionState::Connected {
            if let Some(event_loop) = self.event_loop.lock().await.as_mut() {
                self.disconnect_gracefully(event_loop).await;
            }
        }

        let failed = {
            let mut session = self.shared.session.lock().await;
            session.transition(ConnectionEvent::ClientShutdown);
            session.fail_all()
        };
        if failed > 0 {
            warn!(target: "mqtt_transport", failed, "Publishes still unconfirmed at shutdown");
        }

        self.event_loop.lock().await.take();
        self.stop_dispatcher().await;
        info!(target: "mqtt_transport", client_id = %self.options.client_id, "MQTT transport cleaned up");
    }

    /// Give in-flight publishes the grace period, then send DISCONNECT
    async fn disconnect_gracefully(&self, event_loop: &mut EventLoop) {
        let deadline = Instant::now() + self.options.disconnect_grace;
        let mut disconnect_requested = false;
        let mut attempts = 0u32;

        loop {
            if !disconnect_requested {
                let outstanding = self.shared.session.lock().await.outstanding();
                if outstanding == 0 || Instant::now() >= deadline {
                    if outstanding > 0 {
                        warn!(target: "mqtt_transport", outstanding, "Disconnecting with unconfirmed publishes");
                    }
                    if let Err(e) = self.shared.sink.try_disconnect() {
                        warn!(target: "mqtt_transport", "Disconnect request failed: {:?}", e);
                        return;
                    }
                    disconnect_requested = true;
                }
            }

            let wait = deadline
                .saturating_duration_since(Instant::now())
                .max(DISCONNECT_FLUSH);
            match tokio::time::timeout(wait, event_loop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                    debug!(target: "mqtt_transport", "DISCONNECT sent");
                    return;
                }
                Ok(Ok(event)) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    self.shared.process_route(route, &mut attempts).await;
                }
                Ok(Err(e)) => {
                    debug!(target: "mqtt_transport", "Event loop closed during disconnect: {}", e);
                    return;
                }
                Err(_) if disconnect_requested => return,
                Err(_) => {}
            }
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Stops a pump left running by a caller that skipped cleanup
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_dispatcher(
    handler: Arc<dyn TransportHandler>,
    mut events_rx: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            TransportEvent::Message(message) => handler.on_message(message).await,
            TransportEvent::ConnectionLost(reason) => handler.on_connection_lost(&reason).await,
            TransportEvent::Delivered(token) => handler.on_delivered(token).await,
        }
    }
    debug!(target: "mqtt_transport", "Event dispatcher stopped");
}

/// Background pump: polls the event loop and reconnects with backoff
///
/// Returns the event loop so cleanup can send DISCONNECT through it.
async fn run_pump(
    shared: Arc<Shared>,
    mut event_loop: EventLoop,
    reconnect: ReconnectConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> EventLoop {
    info!(target: "mqtt_transport", client_id = %shared.client_id, "MQTT pump started");
    let mut reconnect_attempts = 0u32;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            polled = event_loop.poll() => match polled {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    shared.process_route(route, &mut reconnect_attempts).await;
                }
                Err(e) => {
                    shared.connection_lost(e.to_string()).await;

                    let decision = HealthMonitor::should_attempt_reconnection(
                        reconnect_attempts,
                        &reconnect,
                        *shutdown_rx.borrow(),
                    );
                    match decision {
                        ReconnectionDecision::Proceed { attempt, delay } => {
                            reconnect_attempts = attempt;
                            info!(
                                target: "mqtt_transport",
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "Reconnecting after delay"
                            );
                            if !interruptible_sleep(&mut shutdown_rx, delay).await {
                                break;
                            }
                            shared
                                .session
                                .lock()
                                .await
                                .transition(ConnectionEvent::ReconnectionStarted(attempt));
                        }
                        ReconnectionDecision::AbortShutdownRequested => break,
                        ReconnectionDecision::AbortReconnectDisabled => {
                            warn!(target: "mqtt_transport", "Automatic reconnection disabled, pump stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    info!(target: "mqtt_transport", client_id = %shared.client_id, "MQTT pump stopped");
    event_loop
}

/// Periodic bookkeeping alongside the pump
async fn run_housekeeping(
    shared: Arc<Shared>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => shared.housekeeping().await,
        }
    }
}

/// Sleep unless shutdown is signalled first; returns false on shutdown
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!(target: "mqtt_transport", "Shutdown signal received during reconnection delay");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> PublishOutcome {
        MqttTransport::publish(self, topic, payload, qos, retain, timeout).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        MqttTransport::subscribe(self, filter, qos).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        MqttTransport::unsubscribe(self, filter).await
    }

    fn connection_state(&self) -> ConnectionState {
        MqttTransport::connection_state(self)
    }

    async fn cleanup(&self) {
        MqttTransport::cleanup(self).await
    }
}
