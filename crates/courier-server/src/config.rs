//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development (in-memory store, single instance).

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

use courier_shared::constants::{
    DEFAULT_HTTP_PORT, HUB_QUEUE_CAPACITY, OUTBOUND_CAPACITY, PRESENCE_TTL_SECS, WRITE_WAIT_SECS,
};
use courier_shared::LocationId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Redis connection URL. When unset the in-memory backend is used,
    /// which only works for a single instance.
    /// Env: `REDIS_URL`
    pub redis_url: Option<String>,

    /// Identity of this process on the relay; frames it published itself are
    /// skipped when they come back.
    /// Env: `INSTANCE_ID`
    /// Default: random UUID per start.
    pub instance_id: Uuid,

    /// Lifetime of the online flag between heartbeats.
    /// Env: `PRESENCE_TTL_SECS`
    /// Default: `60`
    pub presence_ttl: Duration,

    /// Frames buffered per connection before it counts as stalled.
    /// Env: `OUTBOUND_CAPACITY`
    /// Default: `256`
    pub outbound_capacity: usize,

    /// Bounded wait for one socket write before the connection is abandoned.
    /// Env: `WRITE_WAIT_SECS`
    /// Default: `10`
    pub write_wait: Duration,

    /// Pending hub commands before callers start waiting.
    /// Env: `HUB_QUEUE_CAPACITY`
    /// Default: `1024`
    pub hub_queue_capacity: usize,

    /// Locations whose relay channel is subscribed at startup. Any other
    /// location is subscribed when its first connection arrives.
    /// Env: `RELAY_LOCATIONS` (comma-separated)
    pub relay_locations: Vec<LocationId>,

    /// Sustained inbound frames per second per connection.
    /// Env: `INBOUND_RATE`
    /// Default: `20`
    pub inbound_rate: f64,

    /// Inbound burst allowance per connection.
    /// Env: `INBOUND_BURST`
    /// Default: `40`
    pub inbound_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            redis_url: None,
            instance_id: Uuid::new_v4(),
            presence_ttl: Duration::from_secs(PRESENCE_TTL_SECS),
            outbound_capacity: OUTBOUND_CAPACITY,
            write_wait: Duration::from_secs(WRITE_WAIT_SECS),
            hub_queue_capacity: HUB_QUEUE_CAPACITY,
            relay_locations: Vec::new(),
            inbound_rate: 20.0,
            inbound_burst: 40.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(url) = var("REDIS_URL") {
            if !url.trim().is_empty() {
                config.redis_url = Some(url);
            }
        }

        if let Some(id) = var("INSTANCE_ID") {
            match Uuid::parse_str(id.trim()) {
                Ok(parsed) => config.instance_id = parsed,
                Err(e) => {
                    tracing::warn!(value = %id, error = %e, "Invalid INSTANCE_ID, using random")
                }
            }
        }

        if let Some(secs) = parse_positive::<u64>(&var, "PRESENCE_TTL_SECS") {
            config.presence_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = parse_positive::<usize>(&var, "OUTBOUND_CAPACITY") {
            config.outbound_capacity = n;
        }

        if let Some(secs) = parse_positive::<u64>(&var, "WRITE_WAIT_SECS") {
            config.write_wait = Duration::from_secs(secs);
        }

        if let Some(n) = parse_positive::<usize>(&var, "HUB_QUEUE_CAPACITY") {
            config.hub_queue_capacity = n;
        }

        if let Some(list) = var("RELAY_LOCATIONS") {
            config.relay_locations = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(LocationId::from)
                .collect();
        }

        if let Some(rate) = parse_positive::<f64>(&var, "INBOUND_RATE") {
            config.inbound_rate = rate;
        }

        if let Some(burst) = parse_positive::<f64>(&var, "INBOUND_BURST") {
            config.inbound_burst = burst;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a strictly positive number, warning and returning `None` otherwise.
fn parse_positive<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = var(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(var = %name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
