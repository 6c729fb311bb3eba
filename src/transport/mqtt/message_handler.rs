//! Pure routing of rumqttc events
//!
//! The event loop in [`client`](super::client) polls rumqttc and hands every
//! event to [`MessageHandler::route_mqtt_event`], which decides what happens
//! with it without performing any I/O.

use crate::protocol::topics::qos_to_u8;
use crate::transport::TransportEvent;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the matching handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: qos_to_u8(publish.qos),
                    retain: publish.retain,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => {
                    if suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        EventRoute::SubscriptionRejected {
                            packet_id: suback.pkid,
                        }
                    } else {
                        EventRoute::SubscriptionConfirmed {
                            packet_id: suback.pkid,
                        }
                    }
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether a refused handshake is a credentials problem
    pub fn is_authentication_failure(code: ConnectReturnCode) -> bool {
        matches!(
            code,
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Session established
    ConnectionAcknowledged,
    /// Broker refused the handshake
    ConnectionRefused(ConnectReturnCode),
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        qos: u8,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// A SUBSCRIBE left for the broker under this packet id
    SubscribeSent { packet_id: u16 },
    SubscriptionConfirmed { packet_id: u16 },
    /// At least one filter of a SUBSCRIBE was refused by the broker
    SubscriptionRejected { packet_id: u16 },
    /// Infrastructure event (PingResp, UnsubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

impl EventRoute {
    /// Transport event to forward to the manager, if any
    pub fn into_transport_event(self) -> Option<TransportEvent> {
        match self {
            Self::MessageReceived {
                topic,
                payload,
                qos,
                retain,
            } => Some(TransportEvent::Message {
                topic,
                payload,
                qos,
                retain,
            }),
            Self::Disconnected => Some(TransportEvent::ConnectionLost(
                "Broker closed the connection".to_string(),
            )),
            _ => None,
        }
    }
}
