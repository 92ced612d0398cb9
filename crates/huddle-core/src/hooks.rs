//! Collaborator contracts.
//!
//! The relay neither validates credentials nor stores messages itself. It
//! resolves identities through an [`Authenticator`] and hands accepted chat
//! messages to a [`PersistenceHook`]. The history read path goes through a
//! [`HistoryStore`].

use crate::room::{RoomId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_protocol::{Envelope, EnvelopeType};
use std::collections::VecDeque;
use thiserror::Error;

/// Default number of messages kept per room by [`MemoryStore`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Persistence errors. Logged by the relay, never surfaced to clients.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the message.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing token")]
    MissingToken,

    /// The token did not validate.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token has expired.
    #[error("Token expired")]
    Expired,
}

/// Called once for every accepted `message-create`, off the relay's path.
#[async_trait]
pub trait PersistenceHook: Send + Sync + 'static {
    async fn persist(&self, envelope: &Envelope) -> Result<(), PersistError>;
}

/// Read path for room history.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Up to `limit` messages of `room` created strictly before `before`,
    /// newest first.
    async fn fetch(
        &self,
        room: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Envelope>, PersistError>;
}

/// Resolves a bearer token to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// A hook that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

#[async_trait]
impl PersistenceHook for NoopHook {
    async fn persist(&self, _envelope: &Envelope) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Bounded in-process message store.
///
/// Keeps the most recent messages of each room; older ones are discarded.
#[derive(Debug)]
pub struct MemoryStore {
    rooms: DashMap<RoomId, VecDeque<Envelope>>,
    capacity: usize,
}

impl MemoryStore {
    /// Create a store keeping [`DEFAULT_HISTORY_CAPACITY`] messages per room.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a store keeping `capacity` messages per room.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored messages in a room.
    #[must_use]
    pub fn len(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.len()).unwrap_or(0)
    }

    /// Check if a room has no stored messages.
    #[must_use]
    pub fn is_empty(&self, room: &str) -> bool {
        self.len(room) == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceHook for MemoryStore {
    async fn persist(&self, envelope: &Envelope) -> Result<(), PersistError> {
        if envelope.kind != EnvelopeType::MessageCreate {
            return Err(PersistError::Rejected(format!(
                "cannot store {} envelopes",
                envelope.kind
            )));
        }

        let mut messages = self.rooms.entry(envelope.room.clone()).or_default();
        messages.push_back(envelope.clone());
        while messages.len() > self.capacity {
            messages.pop_front();
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn fetch(
        &self,
        room: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Envelope>, PersistError> {
        let Some(messages) = self.rooms.get(room) else {
            return Ok(Vec::new());
        };

        Ok(messages
            .iter()
            .rev()
            .filter(|m| match (before, m.created_at) {
                (Some(before), Some(created)) => created < before,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
