//! The message envelope.
//!
//! Mostly adopts the AMQP basic properties: they are common values used to
//! implement patterns on top of the mailbox system. A message is immutable
//! once accepted, except for the local-index suffix the owning mailbox
//! appends to its id on enqueue.

use crate::core::ids::MessageId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Generic named headers available to the application.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, serde_json::Value>,

    /// MIME content type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    /// MIME content encoding.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_encoding: String,
    /// 0 to 9.
    #[serde(default, skip_serializing_if = "is_zero_u8")]
    pub priority: u8,
    /// Correlation identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    /// Mailbox name to reply to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_to: String,
    /// Message identifier; assigned on push when empty.
    #[serde(default, skip_serializing_if = "MessageId::is_empty")]
    pub message_id: MessageId,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Message type name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Creating user id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    /// Creating application id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "body_bytes")]
    pub body: Vec<u8>,
}

fn is_zero_u8(v: &u8) -> bool {
    *v == 0
}

/// Bodies are arbitrary bytes; encode them as base64 text so the envelope
/// stays self-describing.
pub(crate) mod body_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

impl Message {
    /// A message carrying only a body.
    pub fn new(body: impl Into<Vec<u8>>) -> Message {
        Message {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn get_header(&self, name: &str) -> Option<&serde_json::Value> {
        self.headers.get(name)
    }

    /// Equality compares bodies only.
    pub fn equal(&self, other: &Message) -> bool {
        self.body == other.body
    }

    /// Encode as a self-describing record.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message encoding is infallible")
    }

    /// Decode a persisted record; failure is a data-integrity error.
    pub fn decode(data: &[u8]) -> Result<Message> {
        serde_json::from_slice(data).map_err(|_| Error::CorruptMailbox)
    }
}
