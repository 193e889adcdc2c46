//! Message, result and event envelope types
//!
//! These are the value types exchanged between publishers, subscribers and
//! handlers. Outbound traffic is a [`BrokerMessage`]; inbound traffic is parsed
//! into an [`EventEnvelope`] and handed to handlers together with an
//! [`EventContext`] describing where it came from.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// JSON-LD context attached to envelopes that do not carry their own.
pub const DEFAULT_EVENT_CONTEXT: &str = "https://schemas.mqtt-eventbus.dev/contexts/event.jsonld";

/// Event type assigned to payloads without a recognizable type key.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// Placeholder for missing source fields.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Keys checked, in order, for the event type of an inbound payload.
const TYPE_KEYS: [&str; 3] = ["@type", "event_type", "type"];

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible
    #[default]
    AtLeastOnce = 1,
    /// Four-way handshake delivery
    ExactlyOnce = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid QoS level {0}: expected 0, 1 or 2")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl From<QoS> for rumqttc::v5::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// Errors turning an arbitrary value into a message payload
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Payload must serialize to a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Serialize any value into the string-keyed map carried by a [`BrokerMessage`].
pub fn to_payload_map<T: Serialize + ?Sized>(value: &T) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(PayloadError::NotAnObject(json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Outbound message handed to a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: QoS::default(),
            retain: false,
            headers: HashMap::new(),
            correlation_id: None,
            timestamp: None,
        }
    }

    /// Build a message from any serializable value that maps to a JSON object.
    pub fn from_serializable<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        value: &T,
    ) -> Result<Self, PayloadError> {
        Ok(Self::new(topic, to_payload_map(value)?))
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Outcome of a publish attempt. Publishing never returns `Err`; callers branch on this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishResult {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Application that emitted an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub app_key: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl EventSource {
    pub fn new(app_key: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_version: app_version.into(),
            module: None,
            instance_id: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Object(source)) => {
                let field = |key: &str| source.get(key).and_then(Value::as_str).map(str::to_string);
                Self {
                    app_key: field("app_key").unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
                    app_version: field("app_version").unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
                    module: field("module"),
                    instance_id: field("instance_id"),
                }
            }
            Some(Value::String(app_key)) => Self::new(app_key.clone(), UNKNOWN_SOURCE),
            _ => Self::default(),
        }
    }
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new(UNKNOWN_SOURCE, UNKNOWN_SOURCE)
    }
}

/// JSON-LD `@context`: either a URI or an inline map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonLdContext {
    Uri(String),
    Inline(Map<String, Value>),
}

impl Default for JsonLdContext {
    fn default() -> Self {
        JsonLdContext::Uri(DEFAULT_EVENT_CONTEXT.to_string())
    }
}

/// Typed event as seen by handlers, and as published by [`crate::transport::Broker::publish_event`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "@type")]
    pub event_type: String,
    #[serde(rename = "@context", default)]
    pub context: JsonLdContext,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            context: JsonLdContext::default(),
            source: EventSource::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            payload,
            metadata: Map::new(),
        }
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Topic an event publishes to when the caller does not name one.
    pub fn derived_topic(&self) -> String {
        derive_topic(&self.event_type)
    }

    /// Parse an inbound JSON payload.
    ///
    /// Payloads carrying a non-empty `@type`, `event_type` or `type` are mapped field by field,
    /// with defaults for whatever is missing. Anything else is wrapped whole under
    /// `{"data": ...}` with event type `unknown`.
    pub fn from_json(raw: &Value) -> Self {
        let Some(object) = raw.as_object() else {
            return Self::untyped(raw.clone());
        };
        let Some(event_type) = TYPE_KEYS.iter().find_map(|key| {
            object
                .get(*key)
                .and_then(Value::as_str)
                .filter(|event_type| !event_type.is_empty())
        }) else {
            return Self::untyped(raw.clone());
        };

        let str_field = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| object.get(*key).and_then(Value::as_str))
                .map(str::to_string)
        };

        let context = match object.get("@context") {
            Some(Value::String(uri)) => JsonLdContext::Uri(uri.clone()),
            Some(Value::Object(inline)) => JsonLdContext::Inline(inline.clone()),
            _ => JsonLdContext::default(),
        };

        let timestamp = str_field(&["timestamp", "_timestamp"])
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Self {
            id: str_field(&["id"]).unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: event_type.to_string(),
            context,
            source: EventSource::from_json(object.get("source")),
            timestamp,
            correlation_id: str_field(&["correlation_id", "_correlationId"]),
            payload: object.get("payload").cloned().unwrap_or_else(empty_object),
            metadata: object
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn untyped(raw: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("data".to_string(), raw);
        Self::new(UNKNOWN_EVENT_TYPE, Value::Object(payload))
    }
}

/// Map an event type onto a topic: `alerts.raised` becomes `alerts/raised`.
pub fn derive_topic(event_type: &str) -> String {
    if event_type.is_empty() {
        "events/unknown".to_string()
    } else {
        event_type.replace('.', "/")
    }
}

/// Where and when an inbound event was received
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Logical topic, with any configured prefix already stripped
    pub topic: String,
    pub broker_name: String,
    pub received_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub raw_payload: Option<Bytes>,
}

impl EventContext {
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            received_at: Utc::now(),
            message_id: None,
            raw_payload: None,
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_raw_payload(mut self, raw_payload: Option<Bytes>) -> Self {
        self.raw_payload = raw_payload;
        self
    }
}
