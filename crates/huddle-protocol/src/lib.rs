//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle room relay.
//!
//! Every frame exchanged with a client is a single JSON object carried in one
//! WebSocket text message. Two families of frames exist:
//!
//! - [`Envelope`] - room traffic (`message-create`, `join`, `leave`,
//!   `user-list` and the voice signalling kinds), fanned out to every member
//!   of a room
//! - [`ControlFrame`] - per-connection replies (`auth-response`, `error`)
//!   that are never broadcast
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::message("general", "user-1", "hi");
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded, codec::MAX_FRAME_SIZE).unwrap();
//! assert_eq!(decoded.content.as_deref(), Some("hi"));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_auth, encode, encode_control, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{AuthRequest, ControlFrame, Envelope, EnvelopeType, UserList};
