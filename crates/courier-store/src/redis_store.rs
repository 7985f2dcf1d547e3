//! Redis backend.
//!
//! Key/value calls go through a multiplexed connection that is cloned per
//! request. Each subscription opens its own pub/sub connection, forwarded
//! into an mpsc channel by a background task.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{PubSub, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::Result;
use crate::kv::KvStore;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!("Redis connection established");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, usize>(&mut conn)
            .await?;
        Ok(len)
    }

    async fn list_prepend(&self, key: &str, values: &[Bytes]) -> Result<usize> {
        if values.is_empty() {
            return self.list_len(key).await;
        }
        let mut conn = self.conn.clone();
        // LPUSH inserts its arguments one by one at the head, so the last
        // argument ends up first.
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key);
        for value in values.iter().rev() {
            cmd.arg(value.as_ref());
        }
        let len = cmd.query_async::<_, usize>(&mut conn).await?;
        Ok(len)
    }

    async fn list_drain(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        // MULTI/EXEC: nothing can be appended between the read and the delete.
        let (items,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(key)
            .ignore()
            .query_async::<_, (Vec<Vec<u8>>,)>(&mut conn)
            .await?;
        Ok(items)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len = redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await?;
        Ok(len)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().max(1) as u64;
        redis::cmd("PSETEX")
            .arg(key)
            .arg(millis)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, usize>(&mut conn)
            .await?;
        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, subscription) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let msg = tokio::select! {
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    // Consumer dropped its subscription: release the connection.
                    _ = tx.closed() => break,
                };
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %name, error = %e, "Unreadable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(Bytes::from(payload)).await.is_err() {
                    break;
                }
            }
            info!(channel = %name, "Redis subscription ended");
        });

        Ok(subscription)
    }
}
