//! Transport abstraction traits for Huddle.
//!
//! These traits define the interface that all client transports must provide,
//! allowing the relay to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let sequence = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, sequence))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the relay is closing a transport.
///
/// Only a generic reason is ever sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown.
    Normal,
    /// Authentication failed.
    Unauthorized,
    /// Client could not keep up with the room.
    TooSlow,
    /// Client stopped responding.
    Idle,
    /// Unexpected server-side failure.
    Error,
}

impl CloseReason {
    /// WebSocket close code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Idle => 1001,
            Self::Unauthorized => 1008,
            Self::Error => 1011,
            Self::TooSlow => 1013,
        }
    }

    /// Generic human-readable reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "closing",
            Self::Unauthorized => "unauthorized",
            Self::TooSlow => "too slow",
            Self::Idle => "idle timeout",
            Self::Error => "internal error",
        }
    }
}

/// The receiving half of a client transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// A pong from the peer is reported as an empty frame so callers can
    /// track liveness. Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// The sending half of a client transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one encoded frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Send a keep-alive ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the transport.
    async fn close(&mut self, reason: CloseReason) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::Unauthorized.code(), 1008);
        assert_eq!(CloseReason::TooSlow.as_str(), "too slow");
    }
}
