//! Per-message delivery decision: live hand-off or offline queue.
//!
//! Every routed envelope is also published on the relay and produces a push
//! intent, whichever path it took locally. Store or bus failures degrade the
//! outcome and are logged; they never reject the message.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::{CourierError, Identity, MessageEnvelope, PushEvent};

use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::offline_queue::{OfflineQueue, QueueKey};
use crate::push::PushSink;
use crate::relay::Relay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Handed to at least one of the recipient's live connections here.
    Live,
    /// Appended to the recipient's offline queue.
    Queued,
    /// Neither path succeeded on this instance. Other instances may still
    /// deliver it through the relay.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteOutcome {
    pub message_id: Uuid,
    pub recipient: Identity,
    pub path: DeliveryPath,
    pub relayed: bool,
    pub push_emitted: bool,
}

#[derive(Clone)]
pub struct DeliveryRouter {
    hub: HubHandle,
    queue: OfflineQueue,
    relay: Relay,
    push: Arc<dyn PushSink>,
}

impl DeliveryRouter {
    pub fn new(
        hub: HubHandle,
        queue: OfflineQueue,
        relay: Relay,
        push: Arc<dyn PushSink>,
    ) -> Self {
        Self {
            hub,
            queue,
            relay,
            push,
        }
    }

    pub async fn route(&self, envelope: &MessageEnvelope) -> Result<RouteOutcome, ServerError> {
        let recipient = envelope
            .recipient()
            .ok_or(CourierError::NoRecipient(envelope.id))?;
        if envelope.location_id.is_empty() {
            return Err(ServerError::BadRequest("location_id is required".into()));
        }
        let location = &envelope.location_id;
        let payload = envelope.to_bytes()?;

        let live = self.hub.is_live(location, &recipient).await.unwrap_or_else(|e| {
            warn!(location = %location, error = %e, "Live check failed, treating recipient as offline");
            false
        });

        let mut path = DeliveryPath::Queued;
        if live {
            match self.hub.broadcast(location, payload.clone()).await {
                // The recipient may have been dropped as stalled, or left
                // between the check and the broadcast.
                Ok(report) if report.reached(&recipient) => path = DeliveryPath::Live,
                Ok(_) => debug!(
                    message_id = %envelope.id,
                    recipient = %recipient,
                    "Recipient not reached live, falling back to queue"
                ),
                Err(e) => warn!(location = %location, error = %e, "Broadcast failed"),
            }
        }

        if path == DeliveryPath::Queued {
            let key = QueueKey::new(&recipient, location);
            if let Err(e) = self.queue.enqueue(&key, &payload).await {
                warn!(key = %key, message_id = %envelope.id, error = %e, "Offline enqueue failed");
                path = DeliveryPath::Dropped;
            }
        }

        let relayed = match self.relay.publish(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(location = %location, error = %e, "Relay publish failed");
                false
            }
        };

        let push_emitted = match self
            .push
            .emit(&PushEvent::for_envelope(envelope, &recipient))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(message_id = %envelope.id, error = %e, "Push intent not emitted");
                false
            }
        };

        info!(
            message_id = %envelope.id,
            location = %location,
            recipient = %recipient,
            path = ?path,
            relayed,
            "Message routed"
        );

        Ok(RouteOutcome {
            message_id: envelope.id,
            recipient,
            path,
            relayed,
            push_emitted,
        })
    }
}
