//! Shared fixtures for the Huddle benchmarks.

use huddle_core::connection::OutboundQueue;
use huddle_core::{ConnectionHandle, RoomKind, RoomRegistry};
use huddle_protocol::Envelope;

/// Join `members` connections to `room`, returning their queues.
///
/// # Panics
///
/// Panics if `room` is not a valid room id.
pub fn populate(registry: &RoomRegistry, room: &str, members: usize, capacity: usize) -> Vec<OutboundQueue> {
    (0..members)
        .map(|_| {
            let (conn, queue) = ConnectionHandle::new(room, RoomKind::Chat, capacity);
            registry.join(room, conn).expect("valid room");
            queue
        })
        .collect()
}

/// Empty every queue without blocking.
pub fn drain(queues: &mut [OutboundQueue]) {
    for queue in queues {
        while queue.try_recv().is_ok() {}
    }
}

/// A stamped chat message with a body of `len` bytes.
#[must_use]
pub fn message(room: &str, len: usize) -> Envelope {
    Envelope::message(room, "bench-user", "x".repeat(len)).stamp("bench-user")
}
