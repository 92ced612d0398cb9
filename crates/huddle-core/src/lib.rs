//! # huddle-core
//!
//! Room relay core for Huddle.
//!
//! This crate provides the building blocks of the relay:
//!
//! - **Room Registry** - which connections are joined to which room
//! - **Connection** - per-connection state machine and bounded outbound queue
//! - **Presence** - which users are present in a voice room
//! - **Ingress Bridge** - the upstream event source contract and the local
//!   in-process variant
//! - **Relay** - drives a connection through auth, join, pumps and teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│   Bridge    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        │            │  Presence   │     │  Room feed  │
//!        │            └─────────────┘     └─────────────┘
//!        │                                       │
//!        │            ┌─────────────┐            │
//!        └────────────│  Registry   │◀───────────┘
//!                     └─────────────┘
//! ```

pub mod backoff;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod room;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use bridge::{BridgeError, EventStream, IngressBridge, LocalBridge, PrefixedBridge, RoomFanout};
pub use connection::{ConnectionHandle, ConnectionState};
pub use error::RelayError;
pub use hooks::{
    AuthError, Authenticator, HistoryStore, MemoryStore, NoopHook, PersistError, PersistenceHook,
};
pub use presence::{PresenceChange, PresenceTracker, PresenceTurn};
pub use registry::{RegistryError, RegistryStats, RoomRegistry};
pub use relay::{Relay, RelayConfig};
pub use room::{RoomId, RoomKind, UserId};
