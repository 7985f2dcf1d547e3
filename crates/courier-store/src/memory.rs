//! In-process backend.
//!
//! Holds lists, expiring values and broadcast channels behind one lock, which
//! gives every operation the same atomicity Redis provides. Expiry is lazy:
//! a lapsed value is discovered and removed on the next read, never by a
//! timer. Only suitable for a single server instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::Result;
use crate::kv::KvStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct State {
    lists: HashMap<String, Vec<Vec<u8>>>,
    values: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<Bytes>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn receiver_count(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let list = state.lists.entry(key.to_string()).or_default();
        list.push(value.to_vec());
        Ok(list.len())
    }

    async fn list_prepend(&self, key: &str, values: &[Bytes]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let list = state.lists.entry(key.to_string()).or_default();
        list.splice(0..0, values.iter().map(|v| v.to_vec()));
        Ok(list.len())
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut state = self.state.lock().await;
        Ok(state.lists.remove(key).unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map(Vec::len).unwrap_or(0))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.values.remove(key);
                debug!(key = %key, "Expired value evicted on read");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.values.remove(key);
        state.lists.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let state = self.state.lock().await;
        if let Some(tx) = state.channels.get(channel) {
            // No receivers is not an error: nobody was listening.
            let _ = tx.send(Bytes::copy_from_slice(payload));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = {
            let mut state = self.state.lock().await;
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
                .subscribe()
        };

        let (tx, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    // Consumer dropped its subscription.
                    _ = tx.closed() => break,
                };
                match received {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %name, "Memory subscription ended");
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_push_and_drain_in_order() {
        let store = MemoryStore::new();
        store.list_push("q", b"one").await.unwrap();
        store.list_push("q", b"two").await.unwrap();
        assert_eq!(store.list_push("q", b"three").await.unwrap(), 3);

        let drained = store.list_drain("q").await.unwrap();
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
        assert!(store.list_drain("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_prepend_keeps_order_ahead_of_tail() {
        let store = MemoryStore::new();
        store.list_push("q", b"new").await.unwrap();
        let len = store
            .list_prepend("q", &[Bytes::from_static(b"old1"), Bytes::from_static(b"old2")])
            .await
            .unwrap();
        assert_eq!(len, 3);

        let drained = store.list_drain("q").await.unwrap();
        assert_eq!(drained, vec![b"old1".to_vec(), b"old2".to_vec(), b"new".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_channel() {
        let store = MemoryStore::new();
        let sub = store.subscribe("chat:L1").await.unwrap();
        assert_eq!(store.receiver_count("chat:L1").await, 1);

        drop(sub);
        for _ in 0..100 {
            if store.receiver_count("chat:L1").await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("forwarder still holds the channel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_lapses_lazily() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_with_ttl_rearms_expiry() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.set_with_ttl("k", "1", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_plain_set_and_delete() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pubsub_fanout_preserves_order() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("chat:L1").await.unwrap();
        let mut b = store.subscribe("chat:L1").await.unwrap();

        store.publish("chat:L1", b"first").await.unwrap();
        store.publish("chat:L1", b"second").await.unwrap();

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"first"));
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"second"));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let store = MemoryStore::new();
        store.publish("chat:L1", b"missed").await.unwrap();

        let mut late = store.subscribe("chat:L1").await.unwrap();
        store.publish("chat:L1", b"seen").await.unwrap();
        assert_eq!(late.recv().await.unwrap(), Bytes::from_static(b"seen"));
    }
}
