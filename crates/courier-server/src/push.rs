use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use courier_shared::constants::PUSH_EVENTS_CHANNEL;
use courier_shared::PushEvent;
use courier_store::PubSub;

use crate::error::ServerError;

/// Where push intents go. Vendor delivery happens in a separate worker.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn emit(&self, event: &PushEvent) -> Result<(), ServerError>;
}

/// Publishes push intents as JSON on the shared bus.
#[derive(Clone)]
pub struct BusPushSink {
    bus: Arc<dyn PubSub>,
}

impl BusPushSink {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PushSink for BusPushSink {
    async fn emit(&self, event: &PushEvent) -> Result<(), ServerError> {
        let payload = serde_json::to_vec(event).map_err(courier_shared::CourierError::from)?;
        self.bus.publish(PUSH_EVENTS_CHANNEL, &payload).await?;
        debug!(
            message_id = %event.message_id,
            receiver_type = %event.receiver_type,
            receiver_id = %event.receiver_id,
            "Push intent emitted"
        );
        Ok(())
    }
}
