//! Room registry
//!
//! Authoritative in-memory state of which connection is in which room.
//! Holds the per-room membership sets and the reverse connection → room index
//! behind a single lock so the two can never disagree.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

use crate::server::{Connection, ConnectionId, RoomId};

/// Membership set of one room
pub type Members = HashMap<ConnectionId, Connection>;

/// Result of removing a connection from a room
#[derive(Debug, Clone)]
pub struct Departure {
    /// Room the connection was in
    pub room_id: RoomId,
    /// Members still in the room, captured under the lock
    pub remaining: Vec<Connection>,
}

/// Result of `RoomRegistry::enter`
#[derive(Debug, Clone)]
pub struct Entered {
    /// Ids of the other members of the joined room
    pub others: Vec<ConnectionId>,
    /// Set when the connection was moved out of a different room
    pub previous: Option<Departure>,
}

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<RoomId, Members>,
    room_of: HashMap<ConnectionId, RoomId>,
}

impl RegistryState {
    fn insert_member(&mut self, room_id: RoomId, connection: Connection) {
        self.rooms
            .entry(room_id)
            .or_default()
            .insert(connection.id().clone(), connection);
    }

    /// Remove a member, returning a snapshot of who is left if it was present
    fn remove_member(
        &mut self,
        room_id: RoomId,
        connection_id: &ConnectionId,
        retain_empty: bool,
    ) -> Option<Vec<Connection>> {
        let members = self.rooms.get_mut(&room_id)?;
        members.remove(connection_id)?;
        let remaining: Vec<Connection> = members.values().cloned().collect();

        if remaining.is_empty() && !retain_empty {
            self.rooms.remove(&room_id);
            debug!("Room {} removed after last member left", room_id);
        }
        Some(remaining)
    }
}

/// Thread-safe registry of rooms and their members
///
/// Every method takes the lock once and releases it before returning, so
/// callers may send to the returned handles without blocking other rooms.
/// The composite operations (`enter`, `depart`, `relay_target`) are what the
/// router uses; the finer-grained accessors must be paired by the caller
/// (`join_room` with `bind_connection_to_room`, `leave_room` with
/// `unbind_connection`) to keep both indexes in agreement.
///
/// `RoomRegistry::default()` drops rooms when they become empty.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
    /// Keep rooms around after their last member leaves
    retain_empty_rooms: bool,
}

impl RoomRegistry {
    /// Create an empty registry with an explicit empty-room policy
    pub fn with_retain_empty_rooms(retain_empty_rooms: bool) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            retain_empty_rooms,
        }
    }

    pub fn retains_empty_rooms(&self) -> bool {
        self.retain_empty_rooms
    }

    /// Snapshot of all known room ids
    pub async fn list_room_ids(&self) -> HashSet<RoomId> {
        self.state.read().await.rooms.keys().copied().collect()
    }

    /// Join and bind in one step
    ///
    /// A connection already bound to another room is moved out of it first.
    /// Re-entering the same room refreshes the stored handle.
    pub async fn enter(&self, room_id: RoomId, connection: Connection) -> Entered {
        let retain = self.retain_empty_rooms;
        let connection_id = connection.id().clone();
        let mut state = self.state.write().await;

        let previous = match state.room_of.get(&connection_id).copied() {
            Some(old_room) if old_room != room_id => state
                .remove_member(old_room, &connection_id, retain)
                .map(|remaining| Departure {
                    room_id: old_room,
                    remaining,
                }),
            _ => None,
        };

        state.insert_member(room_id, connection);
        state.room_of.insert(connection_id.clone(), room_id);

        let mut others: Vec<ConnectionId> = state
            .rooms
            .get(&room_id)
            .map(|members| {
                members
                    .keys()
                    .filter(|id| **id != connection_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        others.sort();

        Entered { others, previous }
    }

    /// Leave and unbind in one step
    ///
    /// Returns `None` when the connection was not in any room.
    pub async fn depart(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let retain = self.retain_empty_rooms;
        let mut state = self.state.write().await;

        let room_id = state.room_of.remove(connection_id)?;
        let remaining = state
            .remove_member(room_id, connection_id, retain)
            .unwrap_or_default();

        Some(Departure { room_id, remaining })
    }

    /// Handle of `receiver` if the sender is bound to a room that contains it
    pub async fn relay_target(
        &self,
        sender: &ConnectionId,
        receiver: &ConnectionId,
    ) -> Option<(RoomId, Connection)> {
        let state = self.state.read().await;
        let room_id = *state.room_of.get(sender)?;
        let target = state.rooms.get(&room_id)?.get(receiver)?.clone();
        Some((room_id, target))
    }

    /// Number of rooms currently known
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Number of connections bound to a room
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.room_of.len()
    }

    /// Check that the membership sets and the reverse index agree
    #[cfg(test)]
    pub(crate) async fn assert_consistent(&self) {
        let state = self.state.read().await;
        for (connection_id, room_id) in &state.room_of {
            let members = state
                .rooms
                .get(room_id)
                .unwrap_or_else(|| panic!("{} bound to missing room {}", connection_id, room_id));
            assert!(
                members.contains_key(connection_id),
                "{} bound to room {} but not a member",
                connection_id,
                room_id
            );
        }
        for (room_id, members) in &state.rooms {
            for connection_id in members.keys() {
                assert_eq!(
                    state.room_of.get(connection_id),
                    Some(room_id),
                    "{} is a member of room {} but not bound to it",
                    connection_id,
                    room_id
                );
            }
        }
    }
}

/// Fine-grained accessors
///
/// Each call is atomic on its own; pairs that must agree (join + bind,
/// leave + unbind) are only atomic through `enter` and `depart`.
#[allow(dead_code)]
impl RoomRegistry {
    /// True iff a membership set exists for `room_id`
    pub async fn has_room(&self, room_id: RoomId) -> bool {
        self.state.read().await.rooms.contains_key(&room_id)
    }

    /// Add `connection` to the room, creating the room if needed
    pub async fn join_room(&self, room_id: RoomId, connection: Connection) {
        self.state.write().await.insert_member(room_id, connection);
    }

    /// Remove a connection from a room; no-op if either is unknown
    pub async fn leave_room(&self, room_id: RoomId, connection_id: &ConnectionId) {
        let retain = self.retain_empty_rooms;
        self.state
            .write()
            .await
            .remove_member(room_id, connection_id, retain);
    }

    /// Current members of a room
    ///
    /// `None` means the room does not exist; `Some` of an empty map means it
    /// exists with nobody in it.
    pub async fn list_members(&self, room_id: RoomId) -> Option<Members> {
        self.state.read().await.rooms.get(&room_id).cloned()
    }

    /// Record that `connection_id` is in `room_id`
    pub async fn bind_connection_to_room(&self, connection_id: &ConnectionId, room_id: RoomId) {
        self.state
            .write()
            .await
            .room_of
            .insert(connection_id.clone(), room_id);
    }

    /// Forget the room of `connection_id`, returning it if there was one
    pub async fn unbind_connection(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.state.write().await.room_of.remove(connection_id)
    }

    /// Room `connection_id` is bound to, if any
    pub async fn lookup_room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.state.read().await.room_of.get(connection_id).copied()
    }
}
