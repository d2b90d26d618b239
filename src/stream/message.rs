//! Stream message envelopes
//!
//! Frames are JSON objects `{type, ...payload}`. Only the discriminant is
//! interpreted here; payloads stay opaque until a subscriber asks for a
//! typed view with [`InboundMessage::data_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const CONNECTED: &str = "connected";
/// Log line of a running test suite.
pub const SUITE_LOG: &str = "test_suite_log";

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        default,
        rename = "correlation_id",
        alias = "correlationId",
        alias = "request_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl InboundMessage {
    /// Decode a text frame. The frame must be an object with a non-empty
    /// string `type`.
    pub fn decode(text: &str) -> Result<Self, DispatchError> {
        let message: Self = serde_json::from_str(text)?;
        if message.kind.is_empty() {
            return Err(DispatchError::Decode("empty message type".into()));
        }
        Ok(message)
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DispatchError> {
        let text = std::str::from_utf8(bytes).map_err(|e| DispatchError::Decode(e.to_string()))?;
        Self::decode(text)
    }

    /// Keepalive traffic that is answered or dropped by the connection.
    pub fn is_housekeeping(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Typed view of the payload: the `data` member when present, otherwise
    /// the whole payload object.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, DispatchError> {
        let value = match self.payload.get("data") {
            Some(data) => data.clone(),
            None => Value::Object(self.payload.clone()),
        };
        serde_json::from_value(value).map_err(DispatchError::from)
    }
}

/// Outbound control message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    pub fn pong() -> Self {
        Self::new(PONG)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn to_text(&self) -> String {
        // Map<String, Value> plus a String field cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind))
    }
}

/// Payload of a `test_suite_log` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}
