//! Connection hub: the single owner of live connections, grouped by location.
//!
//! The location map lives inside one tokio task. Everything else holds a
//! cloneable [`HubHandle`] and talks to that task over a bounded command
//! channel, so the map is never touched concurrently and every read
//! (`is_live`, `broadcast`) sees the same serialized state as the writes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use courier_shared::{Identity, LocationId};

use crate::connection::{Connection, ConnectionId, ConnectionKey};
use crate::error::ServerError;

// ---------------------------------------------------------------------------
// Command / report types
// ---------------------------------------------------------------------------

/// Commands sent *into* the hub task.
#[derive(Debug)]
enum HubCommand {
    /// Add a connection to its location group.
    Register {
        connection: Connection,
        reply: oneshot::Sender<bool>,
    },
    /// Remove a connection, closing its outbound buffer.
    Unregister {
        key: ConnectionKey,
        reply: oneshot::Sender<bool>,
    },
    /// Fan a payload out to every connection in a location.
    Broadcast {
        location: LocationId,
        payload: Bytes,
        reply: oneshot::Sender<BroadcastReport>,
    },
    /// Is any connection in the location held by this identity?
    IsLive {
        location: LocationId,
        identity: Identity,
        reply: oneshot::Sender<bool>,
    },
    /// Does this identity hold a connection in any location?
    IsConnected {
        identity: Identity,
        reply: oneshot::Sender<bool>,
    },
    /// Number of connections registered under a location.
    Population {
        location: LocationId,
        reply: oneshot::Sender<usize>,
    },
    /// Snapshot of group sizes.
    Stats(oneshot::Sender<Vec<LocationStats>>),
    /// Drop every connection and stop.
    Shutdown,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Identities whose buffer accepted the payload.
    pub reached: Vec<Identity>,
    /// Identities dropped from the group because their buffer was full or closed.
    pub dropped: Vec<Identity>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.reached.len()
    }

    pub fn reached(&self, identity: &Identity) -> bool {
        self.reached.contains(identity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationStats {
    pub location_id: LocationId,
    pub connections: usize,
}

// ---------------------------------------------------------------------------
// Hub state (owned by the task)
// ---------------------------------------------------------------------------

/// Connections registered under one location. Empty groups are pruned.
#[derive(Debug, Default)]
struct LocationGroup {
    members: HashMap<ConnectionId, Connection>,
}

#[derive(Debug, Default)]
struct Hub {
    groups: HashMap<LocationId, LocationGroup>,
}

impl Hub {
    fn register(&mut self, connection: Connection) -> bool {
        let group = self.groups.entry(connection.location().clone()).or_default();
        if group.members.contains_key(&connection.id()) {
            return false;
        }

        info!(
            conn = %connection.id(),
            identity = %connection.identity(),
            location = %connection.location(),
            group_size = group.members.len() + 1,
            "Connection registered"
        );
        group.members.insert(connection.id(), connection);
        true
    }

    fn unregister(&mut self, key: &ConnectionKey) -> bool {
        let Some(group) = self.groups.get_mut(&key.location) else {
            return false;
        };

        // Dropping the connection drops the hub's sender: the buffer closes here.
        let removed = group.members.remove(&key.id).is_some();
        if removed {
            info!(
                conn = %key.id,
                identity = %key.identity,
                location = %key.location,
                "Connection unregistered"
            );
        }
        self.prune(&key.location);
        removed
    }

    fn broadcast(&mut self, location: &LocationId, payload: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(group) = self.groups.get_mut(location) else {
            debug!(location = %location, "No connections to broadcast to");
            return report;
        };

        let mut stalled = Vec::new();
        for (id, connection) in &group.members {
            match connection.try_deliver(payload.clone()) {
                Ok(()) => report.reached.push(connection.identity().clone()),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conn = %id,
                        identity = %connection.identity(),
                        location = %location,
                        "Outbound buffer full, dropping connection"
                    );
                    stalled.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %id, "Outbound buffer closed, dropping connection");
                    stalled.push(*id);
                }
            }
        }

        for id in stalled {
            if let Some(connection) = group.members.remove(&id) {
                report.dropped.push(connection.identity().clone());
            }
        }
        self.prune(location);

        debug!(
            location = %location,
            delivered = report.reached.len(),
            dropped = report.dropped.len(),
            "Broadcast complete"
        );
        report
    }

    fn is_live(&self, location: &LocationId, identity: &Identity) -> bool {
        self.groups.get(location).is_some_and(|group| {
            group
                .members
                .values()
                .any(|connection| connection.identity() == identity)
        })
    }

    fn is_connected(&self, identity: &Identity) -> bool {
        self.groups.values().any(|group| {
            group
                .members
                .values()
                .any(|connection| connection.identity() == identity)
        })
    }

    fn population(&self, location: &LocationId) -> usize {
        self.groups.get(location).map_or(0, |group| group.members.len())
    }

    fn stats(&self) -> Vec<LocationStats> {
        let mut stats: Vec<LocationStats> = self
            .groups
            .iter()
            .map(|(location, group)| LocationStats {
                location_id: location.clone(),
                connections: group.members.len(),
            })
            .collect();
        stats.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        stats
    }

    fn prune(&mut self, location: &LocationId) {
        if self
            .groups
            .get(location)
            .is_some_and(|group| group.members.is_empty())
        {
            self.groups.remove(location);
            debug!(location = %location, "Removed empty location group");
        }
    }
}

// ---------------------------------------------------------------------------
// Handle + spawn
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

/// Spawn the hub in a background tokio task.
///
/// The task runs until [`HubHandle::shutdown`] is called or every handle is
/// dropped. Either way all remaining connections are dropped, which closes
/// their outbound buffers.
pub fn spawn_hub(queue_capacity: usize) -> HubHandle {
    let (tx, mut rx) = mpsc::channel::<HubCommand>(queue_capacity.max(1));

    tokio::spawn(async move {
        let mut hub = Hub::default();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register { connection, reply } => {
                    let _ = reply.send(hub.register(connection));
                }
                HubCommand::Unregister { key, reply } => {
                    let _ = reply.send(hub.unregister(&key));
                }
                HubCommand::Broadcast {
                    location,
                    payload,
                    reply,
                } => {
                    let _ = reply.send(hub.broadcast(&location, payload));
                }
                HubCommand::IsLive {
                    location,
                    identity,
                    reply,
                } => {
                    let _ = reply.send(hub.is_live(&location, &identity));
                }
                HubCommand::IsConnected { identity, reply } => {
                    let _ = reply.send(hub.is_connected(&identity));
                }
                HubCommand::Population { location, reply } => {
                    let _ = reply.send(hub.population(&location));
                }
                HubCommand::Stats(reply) => {
                    let _ = reply.send(hub.stats());
                }
                HubCommand::Shutdown => {
                    info!("Hub shutdown requested");
                    break;
                }
            }
        }

        info!(
            locations = hub.groups.len(),
            "Hub stopped, dropping remaining connections"
        );
    });

    HubHandle { tx }
}

impl HubHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ServerError::HubUnavailable)?;
        rx.await.map_err(|_| ServerError::HubUnavailable)
    }

    /// Hand a connection to the hub. Returns `false` if a connection with the
    /// same id was already registered (the new one is dropped).
    pub async fn register(&self, connection: Connection) -> Result<bool, ServerError> {
        self.request(|reply| HubCommand::Register { connection, reply })
            .await
    }

    /// Remove a connection. Returns `false` if it was already gone, which is
    /// not an error: the buffer was closed by whoever removed it first.
    pub async fn unregister(&self, key: &ConnectionKey) -> Result<bool, ServerError> {
        let key = key.clone();
        self.request(|reply| HubCommand::Unregister { key, reply })
            .await
    }

    pub async fn broadcast(
        &self,
        location: &LocationId,
        payload: Bytes,
    ) -> Result<BroadcastReport, ServerError> {
        let location = location.clone();
        self.request(|reply| HubCommand::Broadcast {
            location,
            payload,
            reply,
        })
        .await
    }

    pub async fn is_live(
        &self,
        location: &LocationId,
        identity: &Identity,
    ) -> Result<bool, ServerError> {
        let location = location.clone();
        let identity = identity.clone();
        self.request(|reply| HubCommand::IsLive {
            location,
            identity,
            reply,
        })
        .await
    }

    pub async fn is_connected(&self, identity: &Identity) -> Result<bool, ServerError> {
        let identity = identity.clone();
        self.request(|reply| HubCommand::IsConnected { identity, reply })
            .await
    }

    pub async fn population(&self, location: &LocationId) -> Result<usize, ServerError> {
        let location = location.clone();
        self.request(|reply| HubCommand::Population { location, reply })
            .await
    }

    pub async fn stats(&self) -> Result<Vec<LocationStats>, ServerError> {
        self.request(HubCommand::Stats).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown).await;
    }
}
