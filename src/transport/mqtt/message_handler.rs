//! Pure message routing for MQTT events
//!
//! This module turns rumqttc events into routing decisions. It performs no
//! I/O; the client acts on the returned [`EventRoute`].

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged {
                            session_present: connack.session_present,
                        }
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos,
                    retain: publish.retain,
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged {
                    packet_id: pubcomp.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: suback
                        .return_codes
                        .iter()
                        .map(|code| match code {
                            SubscribeReasonCode::Success(qos) => Some(*qos),
                            SubscribeReasonCode::Failure => None,
                        })
                        .collect(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent { packet_id: *pkid },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(granted: &[Option<QoS>]) -> Result<(), String> {
        if granted.iter().any(Option::is_none) {
            Err(format!("Subscription rejected by broker: {granted:?}"))
        } else {
            Ok(())
        }
    }

    /// Preview of a payload for debug logs (pure function)
    pub fn payload_preview(payload: &[u8]) -> String {
        const PREVIEW_LEN: usize = 120;

        let text = String::from_utf8_lossy(payload);
        if text.chars().count() > PREVIEW_LEN {
            let cut: String = text.chars().take(PREVIEW_LEN).collect();
            format!("{cut}...")
        } else {
            text.into_owned()
        }
    }

    /// Log an inbound message at debug level
    pub fn log_inbound(topic: &str, payload: &[u8], retain: bool) {
        debug!(
            target: "mqtt_transport",
            topic = %topic,
            retain = retain,
            bytes = payload.len(),
            "Received: {}",
            Self::payload_preview(payload)
        );
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Broker answered the connect with a refusal code
    ConnectionRefused(String),
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    /// Publish written to the network with this packet id (0 for QoS 0)
    PublishSent { packet_id: u16 },
    /// PubAck (QoS 1) or PubComp (QoS 2) received
    PublishAcknowledged { packet_id: u16 },
    /// Subscription confirmed; `None` marks a rejected filter
    SubscriptionConfirmed {
        packet_id: u16,
        granted: Vec<Option<QoS>>,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, PubAck, PubComp, Publish, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged {
                session_present: false
            }
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::from_bytes(
            "weather",
            QoS::AtLeastOnce,
            Bytes::from_static(br#"{"sensor_id":7}"#),
        );
        publish.retain = true;
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => {
                assert_eq!(topic, "weather");
                assert_eq!(payload, br#"{"sensor_id":7}"#.to_vec());
                assert_eq!(qos, QoS::AtLeastOnce);
                assert!(retain);
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_acknowledgments() {
        let puback = Event::Incoming(Packet::PubAck(PubAck::new(4)));
        assert_eq!(
            MessageHandler::route_mqtt_event(&puback),
            EventRoute::PublishAcknowledged { packet_id: 4 }
        );

        let pubcomp = Event::Incoming(Packet::PubComp(PubComp::new(9)));
        assert_eq!(
            MessageHandler::route_mqtt_event(&pubcomp),
            EventRoute::PublishAcknowledged { packet_id: 9 }
        );
    }

    #[test]
    fn test_route_outgoing() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(3))),
            EventRoute::PublishSent { packet_id: 3 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            2,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        )));

        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                assert_eq!(packet_id, 2);
                assert_eq!(granted, vec![Some(QoS::AtLeastOnce), None]);
                assert!(MessageHandler::validate_subscription_success(&granted).is_err());
            }
            other => panic!("unexpected route: {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnect_and_ping() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[Some(QoS::AtLeastOnce)]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[None]).is_err());
    }

    #[test]
    fn test_payload_preview_truncates() {
        let long = vec![b'a'; 500];
        let preview = MessageHandler::payload_preview(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), 123);

        assert_eq!(MessageHandler::payload_preview(b"short"), "short");
    }
}
