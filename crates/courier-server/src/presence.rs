//! Online flag with a TTL plus a durable last-seen timestamp, per identity.
//!
//! Expiry is passive: the store drops the online flag when its TTL lapses and
//! the next query simply sees it gone. Nothing fires on the transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use courier_shared::constants::{LAST_SEEN_PREFIX, ONLINE_PREFIX};
use courier_shared::{CourierError, Identity};
use courier_store::{KvStore, Result};

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    LastSeen(DateTime<Utc>),
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::LastSeen(at) => write!(f, "last seen at {}", at.to_rfc3339()),
            Self::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Set or refresh the online flag and stamp last-seen.
    pub async fn mark_online(&self, identity: &Identity) -> Result<()> {
        self.kv
            .set_with_ttl(&online_key(identity), "1", self.ttl)
            .await?;
        self.kv
            .set(&last_seen_key(identity), &Utc::now().timestamp().to_string())
            .await?;
        debug!(identity = %identity, ttl_secs = self.ttl.as_secs(), "Marked online");
        Ok(())
    }

    pub async fn mark_offline(&self, identity: &Identity) -> Result<()> {
        self.kv.delete(&online_key(identity)).await?;
        debug!(identity = %identity, "Marked offline");
        Ok(())
    }

    pub async fn is_online(&self, identity: &Identity) -> Result<bool> {
        Ok(self.kv.get(&online_key(identity)).await?.is_some())
    }

    pub async fn status(&self, identity: &Identity) -> Result<PresenceStatus> {
        if self.is_online(identity).await? {
            return Ok(PresenceStatus::Online);
        }

        let last_seen = self
            .kv
            .get(&last_seen_key(identity))
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(last_seen.map_or(PresenceStatus::Offline, PresenceStatus::LastSeen))
    }

    /// Status lookup by raw ids; whichever of the two is non-blank wins,
    /// the user id first. The location does not narrow presence.
    pub async fn status_of(
        &self,
        user_id: Option<&str>,
        contact_id: Option<&str>,
    ) -> std::result::Result<PresenceStatus, ServerError> {
        let identity = match (non_blank(user_id), non_blank(contact_id)) {
            (Some(user), _) => Identity::user(user),
            (None, Some(contact)) => Identity::contact(contact),
            (None, None) => {
                return Err(CourierError::Identity("user_id or contact_id is required".into()).into())
            }
        };
        Ok(self.status(&identity).await?)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn online_key(identity: &Identity) -> String {
    format!("{}:{}:{}", ONLINE_PREFIX, identity.kind(), identity.id())
}

fn last_seen_key(identity: &Identity) -> String {
    format!("{}:{}:{}", LAST_SEEN_PREFIX, identity.kind(), identity.id())
}
