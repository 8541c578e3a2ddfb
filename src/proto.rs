//! Wire protocol frames.
//!
//! Every sub-stream carries one request and exactly one reply. A frame is a
//! single tag byte followed by a self-describing encoded body for the types
//! that carry one.

use crate::core::ids::MessageId;
use crate::error::{Error, Result};
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Success = 1,
    Error = 2,
    Declare = 3,
    EphemeralDeclare = 4,
    Abandon = 5,
    Poll = 6,
    PollResult = 7,
    LongPoll = 8,
    Push = 9,
    Close = 10,
    Nack = 11,
    Ack = 12,
    Stats = 13,
    StatsResult = 14,
}

impl FrameTag {
    pub fn from_u8(value: u8) -> Option<FrameTag> {
        match value {
            1 => Some(FrameTag::Success),
            2 => Some(FrameTag::Error),
            3 => Some(FrameTag::Declare),
            4 => Some(FrameTag::EphemeralDeclare),
            5 => Some(FrameTag::Abandon),
            6 => Some(FrameTag::Poll),
            7 => Some(FrameTag::PollResult),
            8 => Some(FrameTag::LongPoll),
            9 => Some(FrameTag::Push),
            10 => Some(FrameTag::Close),
            11 => Some(FrameTag::Nack),
            12 => Some(FrameTag::Ack),
            13 => Some(FrameTag::Stats),
            14 => Some(FrameTag::StatsResult),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declare {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Abandon {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPoll {
    pub name: String,
    /// Wait bound as a duration string, e.g. `"500ms"` or `"1m30s"`.
    pub duration: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    pub name: String,
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nack {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResult {
    pub in_flight: u64,
}

/// Encode a tag plus body into one frame.
pub fn encode_frame<T: Serialize>(tag: FrameTag, body: &T) -> Result<Bytes> {
    let payload =
        serde_json::to_vec(body).map_err(|e| Error::Protocol(format!("encode: {e}")))?;
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag.as_u8());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Encode a body-less frame (`Success`, `Close`, `Stats`).
pub fn encode_bare(tag: FrameTag) -> Bytes {
    Bytes::copy_from_slice(&[tag.as_u8()])
}

/// Split a frame into its tag and body bytes.
pub fn split_frame(frame: &[u8]) -> Result<(FrameTag, &[u8])> {
    let Some((&tag, body)) = frame.split_first() else {
        return Err(Error::Protocol("empty frame".to_string()));
    };
    let tag = FrameTag::from_u8(tag)
        .ok_or_else(|| Error::Protocol(format!("unknown tag {tag}")))?;
    Ok((tag, body))
}

/// Decode a frame body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Protocol(format!("decode: {e}")))
}
