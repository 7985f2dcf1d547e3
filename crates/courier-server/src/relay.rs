//! Cross-instance relay over per-location bus channels.
//!
//! Every routed envelope is published on `chat:<location>`. Each instance
//! subscribed to that channel feeds the envelope into its own hub, except the
//! instance that published it, which already handled it locally.
//! Delivery is at-most-once with no replay; the offline queue is the durable
//! path.
//!
//! Sessions subscribe their location on connect and release it when the last
//! local connection there goes away. Pinned locations stay subscribed for the
//! life of the process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_shared::{LocationId, MessageEnvelope, RelayFrame};
use courier_store::PubSub;

use crate::error::ServerError;
use crate::hub::HubHandle;

/// A running channel forwarder.
struct Feed {
    id: Uuid,
    task: AbortHandle,
    pinned: bool,
}

#[derive(Clone)]
pub struct Relay {
    bus: Arc<dyn PubSub>,
    hub: HubHandle,
    instance_id: Uuid,
    feeds: Arc<Mutex<HashMap<LocationId, Feed>>>,
}

impl Relay {
    pub fn new(bus: Arc<dyn PubSub>, hub: HubHandle, instance_id: Uuid) -> Self {
        Self {
            bus,
            hub,
            instance_id,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), ServerError> {
        let frame = RelayFrame {
            origin: self.instance_id,
            envelope: envelope.clone(),
        };
        let channel = envelope.location_id.to_channel();
        self.bus.publish(&channel, &frame.to_bytes()?).await?;
        debug!(channel = %channel, message_id = %envelope.id, "Relayed envelope");
        Ok(())
    }

    /// Start feeding a location's channel into the local hub. Subscribing an
    /// already subscribed location does nothing.
    pub async fn subscribe(&self, location: &LocationId) -> Result<(), ServerError> {
        self.start_feed(location, false).await
    }

    /// Subscribe a location and keep it subscribed even while no local
    /// connection is there.
    pub async fn pin(&self, location: &LocationId) -> Result<(), ServerError> {
        self.start_feed(location, true).await
    }

    async fn start_feed(&self, location: &LocationId, pinned: bool) -> Result<(), ServerError> {
        let mut feeds = self.feeds.lock().await;
        if let Some(feed) = feeds.get_mut(location) {
            feed.pinned |= pinned;
            return Ok(());
        }

        let channel = location.to_channel();
        let mut frames = self.bus.subscribe(&channel).await?;
        info!(channel = %channel, pinned, "Relay subscribed");

        let feed_id = Uuid::new_v4();
        let relay = self.clone();
        let feed_location = location.clone();
        let task = tokio::spawn(async move {
            while let Some(raw) = frames.recv().await {
                relay.forward(&feed_location, &raw).await;
            }

            let mut feeds = relay.feeds.lock().await;
            if feeds.get(&feed_location).is_some_and(|feed| feed.id == feed_id) {
                feeds.remove(&feed_location);
            }
            warn!(location = %feed_location, "Relay subscription closed");
        });

        feeds.insert(
            location.clone(),
            Feed {
                id: feed_id,
                task: task.abort_handle(),
                pinned,
            },
        );
        Ok(())
    }

    /// Drop the location's subscription if it is not pinned and the local hub
    /// holds no connection there. Returns whether a subscription was dropped.
    ///
    /// The population check runs under the feed lock, so a session that
    /// registered first and subscribes afterwards is never left unfed.
    pub async fn release_if_idle(&self, location: &LocationId) -> Result<bool, ServerError> {
        let mut feeds = self.feeds.lock().await;
        let Some(feed) = feeds.get(location) else {
            return Ok(false);
        };
        if feed.pinned || self.hub.population(location).await? > 0 {
            return Ok(false);
        }

        if let Some(feed) = feeds.remove(location) {
            feed.task.abort();
        }
        info!(location = %location, "Relay unsubscribed, no local connections");
        Ok(true)
    }

    #[cfg(test)]
    pub async fn is_subscribed(&self, location: &LocationId) -> bool {
        self.feeds.lock().await.contains_key(location)
    }

    async fn forward(&self, location: &LocationId, raw: &[u8]) {
        let frame = match RelayFrame::from_slice(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(location = %location, error = %e, "Unreadable relay frame");
                return;
            }
        };

        if frame.origin == self.instance_id {
            return;
        }

        let payload = match frame.envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(location = %location, error = %e, "Could not re-encode relayed envelope");
                return;
            }
        };

        match self.hub.broadcast(location, payload).await {
            Ok(report) => debug!(
                location = %location,
                origin = %frame.origin,
                delivered = report.delivered(),
                "Relayed envelope delivered locally"
            ),
            Err(e) => warn!(location = %location, error = %e, "Relay could not reach hub"),
        }
    }
}
