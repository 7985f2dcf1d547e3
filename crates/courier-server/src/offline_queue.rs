//! Durable per-recipient backlog for messages that could not go out live.
//!
//! One list per (recipient kind, location, recipient id), appended at the tail
//! and drained whole on reconnect. The drain is a single store primitive, so a
//! message routed while a flush is in progress either lands in this batch or
//! stays queued for the next one.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::constants::OFFLINE_QUEUE_PREFIX;
use courier_shared::{Identity, LocationId};
use courier_store::{KvStore, Result};

use crate::receipts::DeliveryReceipts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKey(String);

impl QueueKey {
    pub fn new(recipient: &Identity, location: &LocationId) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            OFFLINE_QUEUE_PREFIX,
            recipient.kind(),
            location,
            recipient.id()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry taken from a queue by a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub payload: Bytes,
    /// Envelope id, when the payload carries a readable one.
    pub id: Option<Uuid>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: Uuid,
}

#[derive(Clone)]
pub struct OfflineQueue {
    kv: Arc<dyn KvStore>,
    receipts: Arc<dyn DeliveryReceipts>,
}

impl OfflineQueue {
    pub fn new(kv: Arc<dyn KvStore>, receipts: Arc<dyn DeliveryReceipts>) -> Self {
        Self { kv, receipts }
    }

    /// Append a payload. Returns the queue length afterwards.
    pub async fn enqueue(&self, key: &QueueKey, payload: &[u8]) -> Result<usize> {
        let len = self.kv.list_push(key.as_str(), payload).await?;
        debug!(key = %key, pending = len, "Message queued for offline recipient");
        Ok(len)
    }

    /// Take the whole backlog, oldest first.
    ///
    /// Nothing is reported delivered here: the caller hands the entries over,
    /// then passes what actually went out to [`OfflineQueue::confirm`] and
    /// what did not to [`OfflineQueue::requeue`].
    pub async fn flush(&self, key: &QueueKey) -> Result<Vec<QueuedMessage>> {
        let items = self.kv.list_drain(key.as_str()).await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let messages: Vec<QueuedMessage> = items
            .into_iter()
            .map(|item| {
                let id = match serde_json::from_slice::<IdOnly>(&item) {
                    Ok(parsed) => Some(parsed.id),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Queued payload has no readable id");
                        None
                    }
                };
                QueuedMessage {
                    payload: Bytes::from(item),
                    id,
                }
            })
            .collect();

        info!(key = %key, count = messages.len(), "Flushed offline queue");
        Ok(messages)
    }

    /// Report flushed entries that reached the recipient. Entries without an
    /// id are skipped; nothing is reported when no id remains.
    pub async fn confirm(&self, key: &QueueKey, delivered: &[QueuedMessage]) {
        let ids: Vec<Uuid> = delivered.iter().filter_map(|m| m.id).collect();
        if ids.is_empty() {
            return;
        }
        debug!(key = %key, count = ids.len(), "Confirming offline delivery");
        self.receipts.on_flushed(&ids).await;
    }

    /// Put undelivered entries back at the head, ahead of anything queued
    /// since the flush, so the next flush sees the original order.
    pub async fn requeue(&self, key: &QueueKey, undelivered: &[QueuedMessage]) -> Result<()> {
        if undelivered.is_empty() {
            return Ok(());
        }
        let payloads: Vec<Bytes> = undelivered.iter().map(|m| m.payload.clone()).collect();
        self.kv.list_prepend(key.as_str(), &payloads).await?;
        warn!(key = %key, count = payloads.len(), "Requeued undelivered backlog");
        Ok(())
    }

    #[cfg(test)]
    pub async fn pending(&self, key: &QueueKey) -> Result<usize> {
        self.kv.list_len(key.as_str()).await
    }
}
