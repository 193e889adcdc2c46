//! Pure payload encoding and event routing for MQTT sessions
//!
//! Outbound payloads get `_timestamp` and `_correlationId` injected here;
//! inbound payloads are decoded here. Neither direction touches the network.

use super::connection::MqttError;
use crate::protocol::topics::full_topic;
use crate::protocol::BrokerMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::Event;
use serde_json::Value;
use std::collections::BTreeSet;

/// Payload key holding the publish time
pub const TIMESTAMP_KEY: &str = "_timestamp";

/// Payload key holding the correlation id
pub const CORRELATION_ID_KEY: &str = "_correlationId";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Pure message encoding and routing decisions
pub struct MessageHandler;

impl MessageHandler {
    /// Serialize an outbound payload.
    ///
    /// `_timestamp` is added when absent, from the message timestamp or `now`.
    /// `_correlationId` is added when the message carries one and the payload does not.
    /// Caller-supplied values are never overwritten.
    pub fn encode_payload(message: &BrokerMessage, now: DateTime<Utc>) -> Result<Vec<u8>, MqttError> {
        let mut payload = message.payload.clone();

        payload
            .entry(TIMESTAMP_KEY)
            .or_insert_with(|| Value::String(message.timestamp.unwrap_or(now).to_rfc3339()));

        if let Some(correlation_id) = &message.correlation_id {
            payload
                .entry(CORRELATION_ID_KEY)
                .or_insert_with(|| Value::String(correlation_id.clone()));
        }

        serde_json::to_vec(&payload).map_err(MqttError::SerializationError)
    }

    /// MQTT v5 properties for an outbound message; headers travel as user properties
    pub fn publish_properties(message: &BrokerMessage) -> PublishProperties {
        let mut user_properties: Vec<(String, String)> = message
            .headers
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        user_properties.sort();

        PublishProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            correlation_data: message
                .correlation_id
                .as_ref()
                .map(|id| Bytes::from(id.clone())),
            user_properties,
            ..Default::default()
        }
    }

    /// Decode an inbound payload as UTF-8 JSON
    pub fn decode_payload(raw: &[u8]) -> Result<Value, MqttError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| MqttError::InvalidPayload(format!("payload is not valid UTF-8: {e}")))?;
        serde_json::from_str(text).map_err(MqttError::SerializationError)
    }

    /// Prefixed, deduplicated filters to subscribe to, in a stable order
    pub fn subscription_filters<'a, I>(prefix: &str, topics: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        topics
            .into_iter()
            .map(|topic| full_topic(prefix, topic))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    reason_codes: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with reason codes
    SubscriptionConfirmed { packet_id: u16, reason_codes: String },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::topics::strip_topic_prefix;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;
    use serde_json::{json, Map};

    fn message(payload: Value) -> BrokerMessage {
        let Value::Object(map) = payload else {
            panic!("test payload must be an object");
        };
        BrokerMessage::new("x", map)
    }

    #[test]
    fn test_encode_injects_timestamp() {
        let now = Utc::now();
        let bytes = MessageHandler::encode_payload(&message(json!({"a": 1})), now).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["a"], 1);
        assert_eq!(value[TIMESTAMP_KEY], now.to_rfc3339());
        assert!(value.get(CORRELATION_ID_KEY).is_none());
    }

    #[test]
    fn test_encode_prefers_message_timestamp() {
        let stamped = DateTime::parse_from_rfc3339("2024-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = message(json!({})).with_timestamp(stamped);

        let bytes = MessageHandler::encode_payload(&msg, Utc::now()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[TIMESTAMP_KEY], "2024-02-03T04:05:06+00:00");
    }

    #[test]
    fn test_encode_never_overwrites_caller_values() {
        let msg = message(json!({
            "_timestamp": "caller-time",
            "_correlationId": "caller-corr"
        }))
        .with_correlation_id("adapter-corr");

        let bytes = MessageHandler::encode_payload(&msg, Utc::now()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[TIMESTAMP_KEY], "caller-time");
        assert_eq!(value[CORRELATION_ID_KEY], "caller-corr");
    }

    #[test]
    fn test_encode_adds_correlation_id() {
        let msg = message(json!({})).with_correlation_id("corr-1");
        let bytes = MessageHandler::encode_payload(&msg, Utc::now()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[CORRELATION_ID_KEY], "corr-1");
    }

    #[test]
    fn test_publish_properties_carry_headers() {
        let msg = message(json!({}))
            .with_header("b", "2")
            .with_header("a", "1")
            .with_correlation_id("corr-1");

        let props = MessageHandler::publish_properties(&msg);
        assert_eq!(
            props.user_properties,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.correlation_data, Some(Bytes::from("corr-1")));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            MessageHandler::decode_payload(br#"{"a":1}"#).unwrap(),
            json!({"a": 1})
        );
        assert!(matches!(
            MessageHandler::decode_payload(b"not json"),
            Err(MqttError::SerializationError(_))
        ));
        assert!(matches!(
            MessageHandler::decode_payload(&[0xff, 0xfe]),
            Err(MqttError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_encode_then_receive_under_prefix() {
        // Publisher side
        let prefix = "p";
        let outbound_topic = full_topic(prefix, "x");
        let now = Utc::now();
        let mut payload = Map::new();
        payload.insert("a".to_string(), json!(1));
        let bytes = MessageHandler::encode_payload(&BrokerMessage::new("x", payload), now).unwrap();

        // Subscriber side
        let logical = strip_topic_prefix(prefix, &outbound_topic);
        let received = MessageHandler::decode_payload(&bytes).unwrap();

        assert_eq!(logical, "x");
        assert_eq!(received, json!({"a": 1, "_timestamp": now.to_rfc3339()}));
    }

    #[test]
    fn test_subscription_filters_prefixed_and_deduplicated() {
        let topics = vec![
            "b/#".to_string(),
            "a/+".to_string(),
            "/a/+".to_string(),
        ];
        assert_eq!(
            MessageHandler::subscription_filters("site", &topics),
            vec!["site/a/+".to_string(), "site/b/#".to_string()]
        );
        assert_eq!(
            MessageHandler::subscription_filters("", &topics),
            vec!["/a/+".to_string(), "a/+".to_string(), "b/#".to_string()]
        );
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("site/meters/1"),
            pkid: 1,
            payload: Bytes::from(r#"{"kwh":1}"#),
            properties: None,
        }));

        let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        else {
            panic!("Expected MessageReceived route");
        };
        assert_eq!(topic, "site/meters/1");
        assert_eq!(&payload[..], br#"{"kwh":1}"#);
        assert!(retain);
    }
}
