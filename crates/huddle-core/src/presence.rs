//! Presence tracking for Huddle.
//!
//! Presence records which authenticated users are in a voice room,
//! independent of how many connections each of them holds. Every mutation
//! returns a full snapshot taken under the same per-room lock, so the
//! `user-list` published afterwards always matches some consistent state.
//!
//! Snapshots are published after an `.await`, so two tasks could otherwise
//! put them on the bus out of order. Callers that mutate and announce take
//! the room's [`PresenceTurn`] first and hold it until the announcement is
//! published; the last `user-list` on the bus is then the current set.

use crate::room::{RoomId, UserId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type Turns = Arc<DashMap<RoomId, Arc<Mutex<()>>>>;

/// Outcome of a presence mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    /// Whether the set of users changed.
    pub changed: bool,
    /// Sorted snapshot of the users present after the mutation.
    pub users: Vec<UserId>,
}

/// Per-room presence sets, refcounted by connection.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    rooms: DashMap<RoomId, HashMap<UserId, usize>>,
    turns: Turns,
}

/// Exclusive right to change and announce one room's presence.
///
/// Released on drop. The room's gate is discarded once nobody holds or
/// waits for it.
#[must_use = "the turn ends when dropped"]
pub struct PresenceTurn {
    guard: Option<OwnedMutexGuard<()>>,
    turns: Turns,
    room: RoomId,
}

impl Drop for PresenceTurn {
    fn drop(&mut self) {
        self.guard = None;
        self.turns
            .remove_if(&self.room, |_, gate| Arc::strong_count(gate) == 1);
    }
}

impl PresenceTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the room's presence turn. Turns are granted in request
    /// order.
    pub async fn turn(&self, room: &str) -> PresenceTurn {
        let gate = self.turns.entry(room.to_string()).or_default().clone();
        PresenceTurn {
            guard: Some(gate.lock_owned().await),
            turns: self.turns.clone(),
            room: room.to_string(),
        }
    }

    /// Record one more connection for `user` in `room`.
    pub fn add_user(&self, room: &str, user: &str) -> PresenceChange {
        let mut entry = self.rooms.entry(room.to_string()).or_default();
        let count = entry.entry(user.to_string()).or_insert(0);
        *count += 1;
        let changed = *count == 1;

        if changed {
            debug!(room = %room, user = %user, "User present");
        }

        PresenceChange {
            changed,
            users: snapshot(&entry),
        }
    }

    /// Drop one connection for `user` in `room`.
    ///
    /// The user disappears only when their last connection is gone; the
    /// room's set is deleted when it empties.
    pub fn remove_user(&self, room: &str, user: &str) -> PresenceChange {
        let change = {
            let Some(mut entry) = self.rooms.get_mut(room) else {
                return PresenceChange {
                    changed: false,
                    users: Vec::new(),
                };
            };

            let changed = match entry.get(user).copied().unwrap_or(0) {
                0 => false,
                1 => {
                    entry.remove(user);
                    debug!(room = %room, user = %user, "User absent");
                    true
                }
                _ => {
                    if let Some(count) = entry.get_mut(user) {
                        *count -= 1;
                    }
                    false
                }
            };

            PresenceChange {
                changed,
                users: snapshot(&entry),
            }
        };

        if change.users.is_empty() {
            self.rooms.remove_if(room, |_, users| users.is_empty());
        }

        change
    }

    /// Sorted snapshot of the users in a room.
    #[must_use]
    pub fn list_users(&self, room: &str) -> Vec<UserId> {
        self.rooms.get(room).map(|e| snapshot(&e)).unwrap_or_default()
    }

    /// Number of distinct users in a room.
    #[must_use]
    pub fn user_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|e| e.len()).unwrap_or(0)
    }

    /// Number of rooms with anyone present.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn snapshot(users: &HashMap<UserId, usize>) -> Vec<UserId> {
    let mut list: Vec<UserId> = users.keys().cloned().collect();
    list.sort();
    list
}
