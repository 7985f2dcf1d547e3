//! # courier-server
//!
//! Real-time delivery and presence for Courier chat.
//!
//! This binary provides:
//! - **Connection hub** holding every live WebSocket, grouped by location
//! - **Delivery routing**: live hand-off when the recipient is connected,
//!   durable offline queue otherwise, plus a push intent for every message
//! - **Presence** (online flag with TTL, last-seen timestamp)
//! - **Cross-instance relay** over per-location pub/sub channels
//! - **REST API** (axum) for health, routing, presence and hub stats

mod api;
mod config;
mod connection;
mod error;
mod hub;
mod offline_queue;
mod presence;
mod push;
mod receipts;
mod relay;
mod router;
mod session;
mod throttle;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_store::Backend;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::offline_queue::OfflineQueue;
use crate::presence::PresenceTracker;
use crate::push::BusPushSink;
use crate::receipts::LogReceipts;
use crate::relay::Relay;
use crate::router::DeliveryRouter;
use crate::session::{SessionContext, SessionLimits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!(
        "Starting {} server v{}",
        courier_shared::constants::APP_NAME,
        env!("CARGO_PKG_VERSION")
    );

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let backend = Backend::connect(config.redis_url.as_deref()).await?;

    let hub = hub::spawn_hub(config.hub_queue_capacity);
    let queue = OfflineQueue::new(backend.kv.clone(), Arc::new(LogReceipts));
    let presence = PresenceTracker::new(backend.kv.clone(), config.presence_ttl);
    let relay = Relay::new(backend.bus.clone(), hub.clone(), config.instance_id);
    let router = DeliveryRouter::new(
        hub.clone(),
        queue.clone(),
        relay.clone(),
        Arc::new(BusPushSink::new(backend.bus.clone())),
    );

    // -----------------------------------------------------------------------
    // 4. Pin the relay to configured locations
    // -----------------------------------------------------------------------
    for location in &config.relay_locations {
        if let Err(e) = relay.pin(location).await {
            warn!(location = %location, error = %e, "Relay subscription failed");
        }
    }

    let app_state = AppState {
        hub: hub.clone(),
        router,
        presence: presence.clone(),
        sessions: SessionContext {
            hub: hub.clone(),
            queue,
            presence,
            relay,
            limits: SessionLimits::from_config(&config),
        },
        kv: backend.kv.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // Closing the hub closes every outbound buffer, so writers send a close
    // frame to their clients.
    hub.shutdown().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
