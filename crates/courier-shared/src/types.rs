use serde::{Deserialize, Serialize};

use crate::constants::RELAY_CHANNEL_PREFIX;
use crate::error::CourierError;

/// Which side of a conversation an identity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// Staff member.
    User,
    /// External party (patient, customer).
    Contact,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Contact => "contact",
        }
    }
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// A connection or message endpoint resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Identity {
    User(String),
    Contact(String),
}

impl Identity {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    pub fn contact(id: impl Into<String>) -> Self {
        Self::Contact(id.into())
    }

    /// Resolve an identity from the optional `user_id` / `contact_id` pair
    /// carried on query strings. Blank values count as absent; exactly one
    /// of the two must remain.
    pub fn from_parts(
        user_id: Option<&str>,
        contact_id: Option<&str>,
    ) -> Result<Self, CourierError> {
        let user = user_id.map(str::trim).filter(|s| !s.is_empty());
        let contact = contact_id.map(str::trim).filter(|s| !s.is_empty());

        match (user, contact) {
            (Some(id), None) => Ok(Self::user(id)),
            (None, Some(id)) => Ok(Self::contact(id)),
            (Some(_), Some(_)) => Err(CourierError::Identity(
                "user_id and contact_id are mutually exclusive".to_string(),
            )),
            (None, None) => Err(CourierError::Identity(
                "one of user_id or contact_id is required".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::User(_) => IdentityKind::User,
            Self::Contact(_) => IdentityKind::Contact,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Contact(id) => id,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Tenant scope (a clinic site, a store) that groups connections and messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Name of the pub/sub channel carrying this location's relay traffic.
    pub fn to_channel(&self) -> String {
        format!("{}{}", RELAY_CHANNEL_PREFIX, self.0)
    }
}

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LocationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
