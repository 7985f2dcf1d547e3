//! A live client connection as the hub sees it.
//!
//! The hub owns the only long-lived sender half of each connection's
//! outbound buffer. Removing the connection from its group drops that sender,
//! which closes the buffer and ends the writer duty.

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use courier_shared::{Identity, LocationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What the owner of a connection keeps after handing it to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub id: ConnectionId,
    pub location: LocationId,
    pub identity: Identity,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    location: LocationId,
    outbound: mpsc::Sender<Bytes>,
}

impl Connection {
    /// Create a connection with a bounded outbound buffer. The receiver half
    /// belongs to the writer duty.
    pub fn open(
        identity: Identity,
        location: LocationId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        Self::with_id(ConnectionId::new(), identity, location, capacity)
    }

    /// As [`Connection::open`], under a caller-chosen id.
    pub(crate) fn with_id(
        id: ConnectionId,
        identity: Identity,
        location: LocationId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id,
            identity,
            location,
            outbound,
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn location(&self) -> &LocationId {
        &self.location
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            id: self.id,
            location: self.location.clone(),
            identity: self.identity.clone(),
        }
    }

    /// Non-blocking hand-off into the outbound buffer.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), mpsc::error::TrySendError<Bytes>> {
        self.outbound.try_send(payload)
    }
}
