//! Ingress bridges.
//!
//! A bridge connects the relay to the upstream source of room events. Every
//! relay instance publishes client traffic through its bridge and consumes
//! the room's event stream from it, so events published on one instance
//! reach the members connected to every instance.
//!
//! The local variant lives here; distributed variants live in
//! `huddle-bridge`.

mod local;

pub use local::LocalBridge;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::room::RoomId;

/// A room's upstream events, in publish order. Not restartable: once it
/// ends, subscribe again.
pub type EventStream = BoxStream<'static, Result<Bytes, BridgeError>>;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Connecting to the upstream failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Subscribing to a room failed.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Publishing an event failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The subscriber fell behind and events were skipped.
    #[error("Subscriber lagged, skipped {0} events")]
    Lagged(u64),

    /// The upstream stayed unreachable after bounded retry.
    #[error("Upstream unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable { attempts: u32, reason: String },
}

/// An upstream event source.
#[async_trait]
pub trait IngressBridge: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Subscribe to a room's events.
    ///
    /// Returns once the upstream has acknowledged the subscription, so
    /// events published after this call completes are not missed.
    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError>;

    /// Publish an event to a room on every relay instance.
    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError>;
}

/// In-process per-room fan-out over tokio broadcast channels.
///
/// Senders are created on first subscribe and dropped when their last
/// subscriber goes away.
#[derive(Debug, Clone)]
pub struct RoomFanout {
    senders: Arc<DashMap<RoomId, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl RoomFanout {
    /// Create a fan-out whose per-room channels hold `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a room. The receiver exists once this returns.
    #[must_use]
    pub fn subscribe(&self, room: &str) -> EventStream {
        let receiver = self
            .senders
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let subscription = Subscription {
            receiver,
            _release: Release {
                senders: self.senders.clone(),
                room: room.to_string(),
            },
        };

        stream::unfold(subscription, |mut subscription| async move {
            match subscription.receiver.recv().await {
                Ok(payload) => Some((Ok(payload), subscription)),
                Err(RecvError::Lagged(skipped)) => {
                    Some((Err(BridgeError::Lagged(skipped)), subscription))
                }
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }

    /// Hand an event to the room's local subscribers.
    ///
    /// Returns the number of subscribers; zero if nobody listens.
    pub fn deliver(&self, room: &str, payload: Bytes) -> usize {
        self.senders
            .get(room)
            .and_then(|sender| sender.send(payload).ok())
            .unwrap_or(0)
    }

    /// Number of rooms with at least one subscriber.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.senders.len()
    }
}

struct Subscription {
    // Dropped before `_release` so the receiver count is already down.
    receiver: broadcast::Receiver<Bytes>,
    _release: Release,
}

struct Release {
    senders: Arc<DashMap<RoomId, broadcast::Sender<Bytes>>>,
    room: RoomId,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.senders
            .remove_if(&self.room, |_, sender| sender.receiver_count() == 0);
    }
}

/// Namespaces room ids before handing them to another bridge, so that
/// several relays can share one upstream without mixing traffic.
pub struct PrefixedBridge {
    inner: Arc<dyn IngressBridge>,
    prefix: String,
}

impl PrefixedBridge {
    /// Wrap `inner`, prefixing every room id with `prefix`.
    #[must_use]
    pub fn new(inner: Arc<dyn IngressBridge>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn channel(&self, room: &str) -> String {
        format!("{}{}", self.prefix, room)
    }
}

#[async_trait]
impl IngressBridge for PrefixedBridge {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
        self.inner.subscribe(&self.channel(room)).await
    }

    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
        self.inner.publish(&self.channel(room), payload).await
    }
}
