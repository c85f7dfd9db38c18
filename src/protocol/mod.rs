//! Wire-level message envelope exchanged over the tunnel socket.
//!
//! A [`Message`] is the unit the codec frames: a type tag, a correlation id
//! pairing a request with its reply, an opaque payload, and a small ordered
//! property bag. The protocol layer never looks inside the payload.

pub mod codec;
pub mod http;

use std::fmt;

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Property naming what the payload of a `Raw` message carries.
pub const PAYLOAD_KIND: &str = "payload-kind";
/// `payload-kind` value for a serialized [`http::HttpRequestEnvelope`].
pub const KIND_HTTP_REQUEST: &str = "http-request";
/// `payload-kind` value for a serialized [`http::HttpResponseEnvelope`].
pub const KIND_HTTP_RESPONSE: &str = "http-response";
/// `payload-kind` value for a verbatim JSON document.
pub const KIND_JSON: &str = "json";
/// `payload-kind` of a reply whose payload is a UTF-8 reason the peer could
/// not serve the request.
pub const KIND_ERROR: &str = "error";

/// Message type tag. Travels as a string so tags unknown to this build
/// survive a decode/encode cycle untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Liveness/latency probe, no payload translation.
    Ping,
    /// Opaque payload interpreted by higher layers.
    Raw,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Raw => "raw",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ping" => Self::Ping,
            "raw" => Self::Raw,
            _ => Self::Other(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tunnel message. Field order is the frame layout; see [`codec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    correlation_id: String,
    payload: Bytes,
    properties: IndexMap<String, String>,
}

impl Message {
    /// Build a message with an explicit correlation id.
    pub fn new(
        message_type: MessageType,
        correlation_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type,
            correlation_id: correlation_id.into(),
            payload: payload.into(),
            properties: IndexMap::new(),
        }
    }

    /// A request expecting a reply, tagged with a fresh random correlation id.
    pub fn request(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::new(message_type, new_correlation_id(), payload)
    }

    /// A fire-and-forget message (empty correlation id).
    pub fn notification(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self::new(message_type, String::new(), payload)
    }

    /// The reply to `request`: same type and correlation id, new payload.
    pub fn response_to(request: &Message, payload: impl Into<Bytes>) -> Self {
        Self::new(
            request.message_type.clone(),
            request.correlation_id.clone(),
            payload,
        )
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn properties(&self) -> &IndexMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// True for fire-and-forget messages.
    pub fn is_notification(&self) -> bool {
        self.correlation_id.is_empty()
    }
}

/// Random 128-bit id rendered as hyphenated text.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_keeps_type_and_correlation() {
        let request = Message::request(MessageType::Raw, &b"GET /status"[..]);
        let response = Message::response_to(&request, &b"200 OK"[..]);
        assert_eq!(response.correlation_id(), request.correlation_id());
        assert_eq!(response.message_type(), &MessageType::Raw);
        assert_eq!(response.payload().as_ref(), b"200 OK");
    }

    #[test]
    fn requests_get_distinct_ids() {
        let a = Message::request(MessageType::Ping, Bytes::new());
        let b = Message::request(MessageType::Ping, Bytes::new());
        assert!(!a.is_notification());
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn unknown_type_tags_are_preserved() {
        let kind = MessageType::from("wirehome.notify".to_string());
        assert_eq!(kind, MessageType::Other("wirehome.notify".into()));
        assert_eq!(String::from(kind), "wirehome.notify");
        assert_eq!(MessageType::from("ping".to_string()), MessageType::Ping);
    }

    #[test]
    fn properties_keep_insertion_order() {
        let msg = Message::notification(MessageType::Raw, Bytes::new())
            .with_property("z", "1")
            .with_property("a", "2");
        let keys: Vec<&str> = msg.properties().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(msg.property("a"), Some("2"));
    }
}
