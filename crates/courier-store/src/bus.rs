use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Messages arriving on a subscribed channel. The stream ends when the
/// backend drops the subscription.
pub type Subscription = mpsc::Receiver<Bytes>;

/// Fire-and-forget broadcast channels shared by every server instance.
///
/// Delivery is at-most-once per subscriber with no replay: a subscriber that
/// is not listening when a message is published never sees it.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Buffer between a backend subscription and its consumer.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;
