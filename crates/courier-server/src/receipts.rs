use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Persistence hook told which messages left the offline queue.
///
/// The implementation is expected to stamp `delivered_at` on each id.
/// Called once per successful flush with a non-empty id list.
#[async_trait]
pub trait DeliveryReceipts: Send + Sync {
    async fn on_flushed(&self, ids: &[Uuid]);
}

/// Receipt sink for deployments where message history lives elsewhere and
/// only a log line is wanted.
#[derive(Debug, Clone, Default)]
pub struct LogReceipts;

#[async_trait]
impl DeliveryReceipts for LogReceipts {
    async fn on_flushed(&self, ids: &[Uuid]) {
        info!(count = ids.len(), "Offline messages delivered");
    }
}
