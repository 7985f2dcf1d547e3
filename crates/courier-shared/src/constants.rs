/// Application name
pub const APP_NAME: &str = "Courier";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// How long an online flag survives without a heartbeat, in seconds
pub const PRESENCE_TTL_SECS: u64 = 60;

/// Outbound frames buffered per live connection before it is considered stalled
pub const OUTBOUND_CAPACITY: usize = 256;

/// Bounded wait for a single socket write, in seconds
pub const WRITE_WAIT_SECS: u64 = 10;

/// Pending commands the hub actor accepts before callers wait
pub const HUB_QUEUE_CAPACITY: usize = 1024;

/// Largest inbound client frame we bother parsing (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Bus channel consumed by the push worker
pub const PUSH_EVENTS_CHANNEL: &str = "push:events";

/// Prefix of the per-location relay channels
pub const RELAY_CHANNEL_PREFIX: &str = "chat:";

/// Store key prefixes
pub const OFFLINE_QUEUE_PREFIX: &str = "offline_queue";
pub const ONLINE_PREFIX: &str = "online";
pub const LAST_SEEN_PREFIX: &str = "last_seen";
