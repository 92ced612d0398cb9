//! In-process bridge. Publishing is a direct in-memory send; only relays
//! sharing the same `LocalBridge` value see each other's events.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::{BridgeError, EventStream, IngressBridge, RoomFanout};

/// Default per-room channel capacity.
pub const DEFAULT_LOCAL_CAPACITY: usize = 1024;

/// Local broadcast bridge.
#[derive(Debug, Clone)]
pub struct LocalBridge {
    fanout: RoomFanout,
}

impl LocalBridge {
    /// Create a local bridge with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOCAL_CAPACITY)
    }

    /// Create a local bridge whose per-room channels hold `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fanout: RoomFanout::new(capacity),
        }
    }
}

impl Default for LocalBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngressBridge for LocalBridge {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
        Ok(self.fanout.subscribe(room))
    }

    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
        let receivers = self.fanout.deliver(room, payload);
        trace!(room = %room, receivers, "Published locally");
        Ok(())
    }
}
