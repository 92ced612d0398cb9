//! Relay error taxonomy.

use crate::bridge::BridgeError;
use crate::connection::ConnectionError;
use crate::hooks::{AuthError, PersistError};
use crate::registry::RegistryError;
use huddle_protocol::ProtocolError;
use huddle_transport::TransportError;
use thiserror::Error;

/// Errors surfaced while serving a connection.
///
/// Each variant maps to one handling policy: `Transport` tears the
/// connection down, `Validation` drops the frame, `Auth` closes after
/// notifying the client, `UpstreamUnavailable` is fatal at startup and
/// `Persistence` is only logged.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The client transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A client frame was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The bridge could not be reached.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] BridgeError),

    /// Persisting a message failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistError),

    /// Joining the room failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Illegal connection state change.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl RelayError {
    /// Machine-readable code for the `error` notice sent to a client.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT",
            Self::Validation(_) => "INVALID_FRAME",
            Self::Auth(_) => "UNAUTHORIZED",
            Self::UpstreamUnavailable(_) => "UNAVAILABLE",
            Self::Persistence(_) => "PERSISTENCE",
            Self::Registry(_) => "INVALID_ROOM",
            Self::Connection(_) => "INTERNAL",
        }
    }
}
