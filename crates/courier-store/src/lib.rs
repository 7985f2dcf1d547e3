//! # courier-store
//!
//! The external key/value and pub/sub store behind the offline queue,
//! presence tracker, relay and push channel.
//!
//! Every operation is a single atomic request against the store, so callers
//! need no locking of their own. Two backends are provided:
//! - [`RedisStore`] for production and multi-instance deployments
//! - [`MemoryStore`] for single-process development and tests

pub mod bus;
pub mod kv;
pub mod memory;
pub mod redis_store;

mod error;

use std::sync::Arc;

pub use bus::{PubSub, Subscription};
pub use error::{Result, StoreError};
pub use kv::KvStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Handles to the key/value side and the pub/sub side of one backend.
#[derive(Clone)]
pub struct Backend {
    pub kv: Arc<dyn KvStore>,
    pub bus: Arc<dyn PubSub>,
}

impl Backend {
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            kv: Arc::new(store.clone()),
            bus: Arc::new(store),
        }
    }

    pub async fn redis(url: &str) -> Result<Self> {
        let store = RedisStore::connect(url).await?;
        Ok(Self {
            kv: Arc::new(store.clone()),
            bus: Arc::new(store),
        })
    }

    /// Redis when a URL is configured, memory otherwise.
    pub async fn connect(redis_url: Option<&str>) -> Result<Self> {
        match redis_url {
            Some(url) => {
                tracing::info!("Using redis backend");
                Self::redis(url).await
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory backend (single instance only)");
                Ok(Self::memory())
            }
        }
    }
}
