use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::{PeerId, ProtoError, ProtoResult};

/// Caller-chosen token tying a request to its replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Application envelope carried over an open data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub sender: PeerId,
    #[serde(default)]
    pub payload: Value,
}

impl AppMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: CorrelationId::new(),
            sender: PeerId::default(),
            payload,
        }
    }

    /// Build an answer that shares this message's correlation id.
    pub fn reply(&self, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: self.correlation_id.clone(),
            sender: PeerId::default(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn to_bytes(&self) -> ProtoResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| ProtoError::Encode {
            kind: "app message",
            source,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> ProtoResult<Self> {
        serde_json::from_slice(bytes).map_err(|source| ProtoError::Decode {
            kind: "app message",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn app_message_uses_camel_case_keys() {
        let message = AppMessage {
            kind: "GET_LONGEST_CHAIN_REQUEST".into(),
            correlation_id: "abc".into(),
            sender: PeerId(7),
            payload: json!([1, 2]),
        };
        let value: Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "GET_LONGEST_CHAIN_REQUEST",
                "correlationId": "abc",
                "sender": 7,
                "payload": [1, 2]
            })
        );
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let request = AppMessage::new("PING_REQUEST", Value::Null);
        let reply = request.reply("PING_REPLY", json!("pong"));
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.kind, "PING_REPLY");
    }

    #[test]
    fn sender_and_payload_are_optional_on_the_wire() {
        let message =
            AppMessage::from_bytes(br#"{"type":"NEW_BLOCK_ANNOUNCEMENT","correlationId":"x"}"#)
                .unwrap();
        assert_eq!(message.sender, PeerId(0));
        assert_eq!(message.payload, Value::Null);
    }

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }
}
