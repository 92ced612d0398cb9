//! Connection state for Huddle.
//!
//! A [`ConnectionHandle`] is the shared, transport-free half of a client
//! connection: identity, room, lifecycle state and the sending side of its
//! bounded outbound queue. The registry holds handles; the pumps in
//! [`crate::relay`] own the transport.

use crate::room::{RoomId, RoomKind, UserId};
use bytes::Bytes;
use huddle_transport::{CloseReason, ConnectionId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Receiving side of a connection's outbound queue, drained by the
/// outbound pump.
pub type OutboundQueue = mpsc::Receiver<Bytes>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport accepted, identity unknown.
    Connecting = 0,
    /// Identity resolved.
    Authenticated = 1,
    /// Member of its room; pumps running.
    Joined = 2,
    /// Tearing down.
    Closing = 3,
    /// Both pumps exited and the transport was released.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Authenticated,
            2 => Self::Joined,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Check whether `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Joined)
                | (Connecting, Closing)
                | (Authenticated, Closing)
                | (Joined, Closing)
                | (Closing, Closed)
        )
    }

    /// Whether the connection is still accepting traffic.
    #[must_use]
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Closing | Self::Closed)
    }
}

/// Connection errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Illegal state transition.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Identity was already set.
    #[error("Connection already authenticated")]
    AlreadyAuthenticated,
}

/// Why a payload could not be queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full; the connection has been marked for
    /// forced closure.
    #[error("Outbound queue full")]
    Overflow,

    /// The connection is closing or closed.
    #[error("Connection closed")]
    Closed,
}

/// Shared handle to a live client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    room: RoomId,
    kind: RoomKind,
    user: OnceLock<UserId>,
    outbound: mpsc::Sender<Bytes>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state together with its outbound
    /// queue of the given capacity.
    #[must_use]
    pub fn new(
        room: impl Into<RoomId>,
        kind: RoomKind,
        capacity: usize,
    ) -> (Arc<Self>, OutboundQueue) {
        Self::with_id(ConnectionId::generate(), room, kind, capacity)
    }

    /// Create a handle with a caller-chosen id.
    #[must_use]
    pub fn with_id(
        id: ConnectionId,
        room: impl Into<RoomId>,
        kind: RoomKind,
        capacity: usize,
    ) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let handle = Arc::new(Self {
            id,
            room: room.into(),
            kind,
            user: OnceLock::new(),
            outbound,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: OnceLock::new(),
            shutdown,
        });

        (handle, queue)
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the room this connection belongs to for its whole lifetime.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Get the room kind.
    #[must_use]
    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// Get the authenticated identity, once resolved.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if the connection still accepts traffic.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if `next` is not a legal successor of the current
    /// state.
    pub fn transition(&self, next: ConnectionState) -> Result<(), ConnectionError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(ConnectionError::InvalidTransition { from, to: next });
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(connection = %self.id, from = ?from, to = ?next, "Connection state changed");
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record the resolved identity and move to `Authenticated`.
    ///
    /// # Errors
    ///
    /// Returns an error if an identity was already set or the connection is
    /// no longer `Connecting`.
    pub fn authenticate(&self, user: impl Into<UserId>) -> Result<(), ConnectionError> {
        self.user
            .set(user.into())
            .map_err(|_| ConnectionError::AlreadyAuthenticated)?;
        self.transition(ConnectionState::Authenticated)
    }

    /// Queue a payload without waiting.
    ///
    /// On overflow the connection is marked for forced closure.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Overflow`] if the queue is full and
    /// [`DeliveryError::Closed`] if the connection is shutting down.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::Closed);
        }
        match self.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %self.id, room = %self.room, "Outbound queue full, closing slow connection");
                self.close(CloseReason::TooSlow);
                Err(DeliveryError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Begin closing the connection and wake both pumps.
    ///
    /// Returns `true` if this call initiated the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        let initiated = self.transition(ConnectionState::Closing).is_ok();
        if initiated {
            let _ = self.close_reason.set(reason);
        }
        self.shutdown.send_replace(true);
        initiated
    }

    /// Mark the connection fully closed after both pumps exited.
    ///
    /// # Errors
    ///
    /// Returns an error unless the connection is `Closing`.
    pub fn mark_closed(&self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Closed)
    }

    /// The reason recorded by the first [`close`](Self::close) call.
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.get().copied().unwrap_or(CloseReason::Normal)
    }

    /// Subscribe to the shutdown signal. The value flips to `true` once,
    /// when closing begins.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
