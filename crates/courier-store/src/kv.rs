use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Key/value primitives the delivery core relies on.
///
/// Each method is one atomic request against the backend. In particular
/// [`KvStore::list_drain`] must read and clear a list in a single step so that
/// no entry appended concurrently is lost.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Append `value` to the tail of the list at `key`. Returns the new length.
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<usize>;

    /// Insert `values` at the head of the list at `key`, keeping their order:
    /// `values[0]` becomes the new first entry. Returns the new length.
    async fn list_prepend(&self, key: &str, values: &[Bytes]) -> Result<usize>;

    /// Take every entry of the list at `key`, oldest first, leaving it empty.
    async fn list_drain(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Set `key` to `value`, expiring after `ttl`. Overwrites and re-arms an
    /// existing expiry.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set `key` to `value` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Current value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}
