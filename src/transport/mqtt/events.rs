//! Classifies raw rumqttc v5 events into what a session acts on

use crate::transport::InboundMessage;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// The subset of broker traffic sessions react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// ConnAck received
    Connected,
    Message(InboundMessage),
    PublishAcked,
    Subscribed,
    /// Broker sent DISCONNECT
    Disconnected,
    /// Pings, outgoing packets and anything else
    Ignored,
}

pub fn classify(event: &Event) -> SessionEvent {
    let Event::Incoming(packet) = event else {
        return SessionEvent::Ignored;
    };

    match packet {
        Packet::ConnAck(_) => SessionEvent::Connected,
        Packet::Publish(publish) => SessionEvent::Message(InboundMessage {
            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
            payload: Bytes::copy_from_slice(&publish.payload),
            retain: publish.retain,
        }),
        Packet::PubAck(_) => SessionEvent::PublishAcked,
        Packet::SubAck(_) => SessionEvent::Subscribed,
        Packet::Disconnect(_) => SessionEvent::Disconnected,
        _ => SessionEvent::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_session_lifecycle_packets() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));

        assert_eq!(classify(&connack), SessionEvent::Connected);
        assert_eq!(classify(&disconnect), SessionEvent::Disconnected);
    }

    #[test]
    fn test_publish_becomes_inbound_message() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("bacon/v1/presence/agent/a1"),
            pkid: 1,
            payload: Bytes::from(r#"{"agent_id":"a1"}"#),
            properties: None,
        }));

        let SessionEvent::Message(message) = classify(&publish) else {
            panic!("expected a message");
        };
        assert_eq!(message.topic, "bacon/v1/presence/agent/a1");
        assert_eq!(&message.payload[..], br#"{"agent_id":"a1"}"#);
        assert!(message.retain);
    }
}
