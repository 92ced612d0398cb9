//! Room abstraction for Huddle.
//!
//! A room is a named set of live connections. Any valid room id may be
//! joined; the room comes into existence with its first member.

use crate::connection::ConnectionHandle;
use huddle_protocol::EnvelopeType;
use huddle_transport::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// An authenticated user identifier.
pub type UserId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room id cannot be empty");
    }
    if name.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Room id contains control characters");
    }
    Ok(())
}

/// The flavour of a room, which decides what clients may send and whether
/// presence is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// Text chat: clients send `message-create`.
    Chat,
    /// Voice: clients exchange signalling frames; presence is tracked.
    Voice,
}

impl RoomKind {
    /// Short name, used in logs and bridge prefixes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Voice => "voice",
        }
    }

    /// Whether clients in this kind of room may originate the given type.
    #[must_use]
    pub fn accepts(&self, kind: EnvelopeType) -> bool {
        match self {
            Self::Chat => kind == EnvelopeType::MessageCreate,
            Self::Voice => kind.is_signal(),
        }
    }

    /// Whether presence is tracked for this kind of room.
    #[must_use]
    pub fn tracks_presence(&self) -> bool {
        matches!(self, Self::Voice)
    }
}

/// Handle to a room's bridge feed task. Aborts the task when dropped, so
/// removing a room entry stops its feed.
///
/// The task reports through `live` whether it currently holds an
/// acknowledged upstream subscription.
#[derive(Debug)]
pub struct FeedTask {
    handle: AbortHandle,
    live: watch::Receiver<bool>,
}

impl FeedTask {
    /// Wrap a spawned task and its liveness signal.
    #[must_use]
    pub fn new(handle: AbortHandle, live: watch::Receiver<bool>) -> Self {
        Self { handle, live }
    }

    /// Whether the feed is subscribed upstream right now.
    #[must_use]
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Watch the feed's liveness.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<bool> {
        self.live.clone()
    }
}

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Membership of one room.
#[derive(Debug)]
pub struct Room {
    /// Room id.
    name: RoomId,
    /// Joined connections.
    members: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// Upstream feed for this room, if any.
    feed: Option<FeedTask>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
            feed: None,
        }
    }

    /// Get the room id.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn insert(&mut self, connection: Arc<ConnectionHandle>) -> bool {
        let id = connection.id().clone();
        let added = self.members.insert(id.clone(), connection).is_none();
        if added {
            debug!(room = %self.name, connection = %id, "Connection joined");
        }
        added
    }

    /// Remove a connection.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.members.remove(connection_id);
        if removed.is_some() {
            debug!(room = %self.name, connection = %connection_id, "Connection left");
        }
        removed
    }

    /// Iterate over the members.
    pub fn members(&self) -> impl Iterator<Item = &Arc<ConnectionHandle>> {
        self.members.values()
    }

    /// Attach the room's upstream feed.
    pub fn set_feed(&mut self, feed: FeedTask) {
        self.feed = Some(feed);
    }

    /// Whether the room's upstream feed is attached and subscribed.
    #[must_use]
    pub fn feed_live(&self) -> bool {
        self.feed.as_ref().is_some_and(FeedTask::is_live)
    }

    /// Watch the liveness of the room's upstream feed, if it has one.
    #[must_use]
    pub fn feed_status(&self) -> Option<watch::Receiver<bool>> {
        self.feed.as_ref().map(FeedTask::status)
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
