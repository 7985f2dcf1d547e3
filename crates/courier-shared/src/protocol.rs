use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::MessageEnvelope;
use crate::error::CourierError;

/// Frames a client may send up a live connection.
///
/// Clients send JSON objects tagged by `type`. Only the tag matters to the
/// server; typing frames are re-broadcast verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Heartbeat, keeps the presence flag alive.
    Ping,
    /// Typing indicator for a conversation.
    Typing {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        typing: bool,
    },
    /// Any other well-formed frame. Ignored.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Parse an inbound frame. `None` means the bytes were not a JSON object
    /// with a `type` tag.
    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Envelope as carried between server instances on a location channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Instance that published the frame; lets it skip its own echo.
    pub origin: Uuid,
    pub envelope: MessageEnvelope,
}

impl RelayFrame {
    pub fn to_bytes(&self) -> Result<Bytes, CourierError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CourierError> {
        Ok(serde_json::from_slice(data)?)
    }
}
