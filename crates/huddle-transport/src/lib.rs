//! # huddle-transport
//!
//! Client transport abstraction layer for the Huddle relay.
//!
//! A client transport is a bidirectional, message-framed duplex stream. The
//! relay splits it into a [`FrameReader`] and a [`FrameWriter`] so the
//! inbound and outbound pumps can run independently:
//!
//! - **WebSocket** - axum WebSocket halves (feature `websocket`)
//! - **Memory** - in-process channel pair for driving connections in tests
//!   (feature `test-util`)
//!
//! ```rust,ignore
//! use huddle_transport::{FrameReader, FrameWriter};
//!
//! async fn echo(mut reader: impl FrameReader, mut writer: impl FrameWriter) {
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         let _ = writer.send(frame).await;
//!     }
//! }
//! ```

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{CloseReason, ConnectionId, FrameReader, FrameWriter, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketReader, WebSocketWriter};
