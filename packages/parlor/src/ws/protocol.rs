//! WebSocket Protocol Types
//!
//! Every application message travels in the same envelope:
//! `{"type": <kind>, "payload": <kind-specific object>}`. The payload stays
//! untyped until a handler for that kind decodes it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::RelayError;

/// Client → server: broadcast a chat line to the sender's room.
pub const EVENT_SEND_MESSAGE: &str = "send_message";
/// Server → client: a chat line delivered to everyone in the room.
pub const EVENT_NEW_MESSAGE: &str = "new_message";
/// Client → server: move the connection into another room.
pub const EVENT_CHANGE_ROOM: &str = "change_room";

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Build an event from a typed payload.
    pub fn new(kind: &str, payload: impl Serialize) -> Result<Self, RelayError> {
        let payload = serde_json::to_value(payload).map_err(|source| RelayError::Encode {
            kind: kind.to_string(),
            source,
        })?;
        Ok(Self {
            kind: kind.to_string(),
            payload,
        })
    }

    /// Parse one WebSocket frame into an envelope. The payload is left opaque.
    pub fn from_frame(frame: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(frame).map_err(RelayError::Decode)
    }

    /// Decode the payload as the type registered for this event's kind.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        T::deserialize(&self.payload).map_err(|source| RelayError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub message: String,
    pub from: String,
    /// RFC 3339 on the wire.
    pub sent: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRoomPayload {
    pub name: String,
}
