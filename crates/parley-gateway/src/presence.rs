use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::RelayEvent;
use parley_types::models::Principal;

use crate::error::RelayError;

pub type ConnectionId = Uuid;

/// Transient address book for fan-out: which connections are open, who
/// owns them, and which room each one is in.
///
/// Nothing here is persisted. A fresh tracker is empty and clients are
/// expected to re-join after a restart.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<RwLock<PresenceState>>,
}

#[derive(Default)]
struct PresenceState {
    connections: HashMap<ConnectionId, ConnectionEntry>,

    /// room_id -> connections currently joined
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,

    /// principal_id -> open connections (one per device)
    principals: HashMap<Uuid, HashSet<ConnectionId>>,
}

struct ConnectionEntry {
    principal: Principal,
    room: Option<Uuid>,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for `principal`. Returns its id and the receiver
    /// that every event addressed to it is pushed into.
    pub async fn register(
        &self,
        principal: Principal,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<RelayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.inner.write().await;
        state.connections.insert(
            conn_id,
            ConnectionEntry {
                principal,
                room: None,
                tx,
            },
        );
        state.principals.entry(principal.id).or_default().insert(conn_id);

        (conn_id, rx)
    }

    /// Drop every trace of a connection. Idempotent.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let mut state = self.inner.write().await;
        let Some(entry) = state.connections.remove(&conn_id) else {
            return;
        };

        if let Some(room_id) = entry.room {
            state.remove_from_room(room_id, conn_id);
        }
        if let Some(conns) = state.principals.get_mut(&entry.principal.id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                state.principals.remove(&entry.principal.id);
            }
        }
    }

    /// Put a connection in `room_id`, leaving any room it was in before.
    /// Returns false if the connection is not registered.
    ///
    /// `ack` is queued for the connection before it becomes visible to
    /// fan-out, so nothing broadcast to the room can overtake it.
    pub async fn join_room(&self, conn_id: ConnectionId, room_id: Uuid, ack: Option<RelayEvent>) -> bool {
        let mut state = self.inner.write().await;
        let previous = match state.connections.get_mut(&conn_id) {
            Some(entry) => {
                if let Some(ack) = ack {
                    if entry.tx.send(ack).is_err() {
                        warn!(%conn_id, %room_id, "join acknowledgement dropped, connection has hung up");
                    }
                }
                entry.room.replace(room_id)
            }
            None => return false,
        };

        if let Some(previous) = previous.filter(|prev| *prev != room_id) {
            state.remove_from_room(previous, conn_id);
        }
        state.rooms.entry(room_id).or_default().insert(conn_id);
        true
    }

    /// Take a connection out of its room. Returns the room it left, if any.
    pub async fn leave_room(&self, conn_id: ConnectionId) -> Option<Uuid> {
        let mut state = self.inner.write().await;
        let room_id = state.connections.get_mut(&conn_id)?.room.take()?;
        state.remove_from_room(room_id, conn_id);
        Some(room_id)
    }

    pub async fn room_of(&self, conn_id: ConnectionId) -> Option<Uuid> {
        self.inner.read().await.connections.get(&conn_id)?.room
    }

    pub async fn is_in_room(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&room_id)
            .is_some_and(|conns| conns.contains(&conn_id))
    }

    pub async fn connections_in_room(&self, room_id: Uuid) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(&room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connections_for_principal(&self, principal_id: Uuid) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .principals
            .get(&principal_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue an event for one connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: RelayEvent) -> Result<(), RelayError> {
        let state = self.inner.read().await;
        let entry = state
            .connections
            .get(&conn_id)
            .ok_or_else(|| RelayError::Transport(format!("connection {conn_id} is not registered")))?;

        entry
            .tx
            .send(event)
            .map_err(|_| RelayError::Transport(format!("connection {conn_id} has hung up")))
    }

    /// Queue an event for every connection in `room_id`. Never blocks on a
    /// receiver; unreachable connections are logged and skipped. Returns the
    /// number of connections the event was queued for.
    pub async fn broadcast_to_room(&self, room_id: Uuid, event: &RelayEvent) -> usize {
        let state = self.inner.read().await;
        let Some(conns) = state.rooms.get(&room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in conns {
            let Some(entry) = state.connections.get(conn_id) else {
                continue;
            };
            match entry.tx.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    let err = RelayError::Transport(format!("connection {conn_id} has hung up"));
                    warn!(%room_id, %conn_id, error = %err, "dropping fan-out target");
                }
            }
        }

        debug!(%room_id, delivered, "fan-out complete");
        delivered
    }
}

impl PresenceState {
    fn remove_from_room(&mut self, room_id: Uuid, conn_id: ConnectionId) {
        if let Some(conns) = self.rooms.get_mut(&room_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
    }
}
