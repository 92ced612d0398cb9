//! Room registry for Huddle.
//!
//! Maps room ids to their live connections. Each room entry is guarded by
//! its `DashMap` shard lock, so join, leave and broadcast on one room are
//! linearizable while unrelated rooms proceed independently. A room entry
//! exists only while it has members.

use crate::connection::{ConnectionHandle, DeliveryError};
use crate::room::{validate_room_id, FeedTask, Room, RoomId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_transport::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// The connection belongs to another room.
    #[error("Connection belongs to room {expected}, not {requested}")]
    RoomMismatch { expected: String, requested: String },
}

/// Tracks which connections are joined to which rooms.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    evictions: AtomicU64,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a connection to a room. Idempotent.
    ///
    /// Returns `true` if the connection was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or the connection was
    /// created for a different room.
    pub fn join(&self, room: &str, connection: Arc<ConnectionHandle>) -> Result<bool, RegistryError> {
        self.join_with(room, connection, |_| None)
    }

    /// Join a connection to a room, running `on_open` if this join creates
    /// the room.
    ///
    /// `on_open` runs while the room's entry is locked, before the new
    /// member becomes visible to broadcasts. The feed it returns is owned by
    /// the room and aborted when the room is removed.
    ///
    /// # Errors
    ///
    /// Same as [`join`](Self::join).
    pub fn join_with<F>(
        &self,
        room: &str,
        connection: Arc<ConnectionHandle>,
        on_open: F,
    ) -> Result<bool, RegistryError>
    where
        F: FnOnce(&str) -> Option<FeedTask>,
    {
        validate_room_id(room).map_err(RegistryError::InvalidRoom)?;
        if connection.room() != room {
            return Err(RegistryError::RoomMismatch {
                expected: connection.room().to_string(),
                requested: room.to_string(),
            });
        }

        match self.rooms.entry(room.to_string()) {
            Entry::Occupied(mut entry) => Ok(entry.get_mut().insert(connection)),
            Entry::Vacant(entry) => {
                let mut new_room = Room::new(room);
                if let Some(feed) = on_open(room) {
                    new_room.set_feed(feed);
                }
                new_room.insert(connection);
                entry.insert(new_room);
                debug!(room = %room, "Created room");
                Ok(true)
            }
        }
    }

    /// Remove a connection from a room. Idempotent.
    ///
    /// The room entry, and with it the room's feed, is removed once its last
    /// member leaves.
    pub fn leave(&self, room: &str, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.rooms.get_mut(room)?.remove(connection_id);

        if let Some((_, deleted)) = self.rooms.remove_if(room, |_, entry| entry.is_empty()) {
            debug!(room = %deleted.name(), "Deleted empty room");
        }

        removed
    }

    /// Queue a payload for every member of a room without waiting.
    ///
    /// Members whose queue is full are evicted and force-closed once the
    /// room lock is released. Returns the number of members the payload was
    /// queued for; unknown rooms yield zero.
    pub fn broadcast(&self, room: &str, payload: Bytes) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        {
            let Some(entry) = self.rooms.get(room) else {
                trace!(room = %room, "Broadcast to room without members");
                return 0;
            };

            for member in entry.members() {
                match member.try_deliver(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::Overflow) => overflowed.push(member.id().clone()),
                    // Already tearing down; its own teardown removes it.
                    Err(DeliveryError::Closed) => {}
                }
            }
        }

        for connection_id in overflowed {
            if self.leave(room, &connection_id).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(room = %room, connection = %connection_id, "Evicted slow connection");
            }
        }

        trace!(room = %room, recipients = delivered, "Broadcast");
        delivered
    }

    /// Check if a connection is joined to a room.
    #[must_use]
    pub fn contains(&self, room: &str, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|entry| entry.contains(connection_id))
    }

    /// Get the number of members in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|e| e.member_count()).unwrap_or(0)
    }

    /// Whether the room's upstream feed is subscribed. Rooms without a
    /// feed, and unknown rooms, report `false`.
    #[must_use]
    pub fn feed_live(&self, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|entry| entry.feed_live())
    }

    /// Watch the liveness of a room's upstream feed.
    #[must_use]
    pub fn feed_status(&self, room: &str) -> Option<watch::Receiver<bool>> {
        self.rooms.get(room).and_then(|entry| entry.feed_status())
    }

    /// Check if a room currently exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Get all room ids.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.rooms.iter().map(|e| e.member_count()).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Force-close every member of every room. Used on shutdown.
    pub fn close_all(&self) {
        let members: Vec<Arc<ConnectionHandle>> = self
            .rooms
            .iter()
            .flat_map(|e| e.members().cloned().collect::<Vec<_>>())
            .collect();

        info!(connections = members.len(), "Closing all connections");
        for member in members {
            member.close(huddle_transport::CloseReason::Normal);
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of rooms with at least one member.
    pub room_count: usize,
    /// Number of joined connections.
    pub connection_count: usize,
    /// Connections evicted for overflowing their queue.
    pub evictions: u64,
}
