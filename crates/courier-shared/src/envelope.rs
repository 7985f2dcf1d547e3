use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CourierError;
use crate::types::{Identity, IdentityKind, LocationId};

/// One chat message as handed to the delivery core.
///
/// The envelope is created and persisted by the REST layer before it reaches
/// the router. The core never mutates it: read/delivered bookkeeping happens
/// in the persistence layer, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub location_id: LocationId,
    /// Conversation grouping key assigned by the session store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_contact_id: Option<String>,

    #[serde(default)]
    pub content: String,
    /// Attachment reference (already uploaded elsewhere).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_read: bool,
}

impl MessageEnvelope {
    /// A minimal text message, stamped now. Mostly useful for tests and tools.
    pub fn text(location_id: impl Into<LocationId>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            location_id: location_id.into(),
            session_id: None,
            sender_user_id: None,
            receiver_user_id: None,
            sender_contact_id: None,
            receiver_contact_id: None,
            content: content.into(),
            file_url: None,
            file_name: None,
            file_type: None,
            sent_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            edited_at: None,
            reply_to: None,
            is_pinned: false,
            is_read: false,
        }
    }

    pub fn sent_by(mut self, sender: &Identity) -> Self {
        match sender {
            Identity::User(id) => self.sender_user_id = Some(id.clone()),
            Identity::Contact(id) => self.sender_contact_id = Some(id.clone()),
        }
        self
    }

    pub fn addressed_to(mut self, receiver: &Identity) -> Self {
        match receiver {
            Identity::User(id) => self.receiver_user_id = Some(id.clone()),
            Identity::Contact(id) => self.receiver_contact_id = Some(id.clone()),
        }
        self
    }

    /// Delivery target: the receiving user when one is set, else the contact.
    pub fn recipient(&self) -> Option<Identity> {
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        non_blank(&self.receiver_user_id)
            .map(Identity::User)
            .or_else(|| non_blank(&self.receiver_contact_id).map(Identity::Contact))
    }

    /// Serialize to the JSON wire form pushed to connections and queues.
    pub fn to_bytes(&self) -> Result<Bytes, CourierError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CourierError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Fire-and-forget notification intent, consumed by the push worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub message_id: Uuid,
    pub location_id: LocationId,
    pub receiver_id: String,
    pub receiver_type: IdentityKind,
    pub content: String,
}

impl PushEvent {
    pub fn for_envelope(envelope: &MessageEnvelope, receiver: &Identity) -> Self {
        Self {
            message_id: envelope.id,
            location_id: envelope.location_id.clone(),
            receiver_id: receiver.id().to_string(),
            receiver_type: receiver.kind(),
            content: envelope.content.clone(),
        }
    }
}
