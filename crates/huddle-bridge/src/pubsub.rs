//! Redis pub/sub bridge.
//!
//! Each room maps to a Redis channel of the same name. Subscriptions use a
//! dedicated pub/sub connection per room feed; publishing goes through one
//! shared multiplexed connection manager, which reconnects on its own.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use huddle_core::{BridgeError, EventStream, IngressBridge};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, trace};

/// Bridge over Redis pub/sub.
#[derive(Clone)]
pub struct RedisBridge {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBridge {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = Client::open(url).map_err(|e| BridgeError::Connect(e.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        debug!(url = %url, "Connected to Redis");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl IngressBridge for RedisBridge {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
        subscribe_channel(&self.client, room).await
    }

    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
        let mut connection = self.publisher.clone();
        let receivers: i64 = connection
            .publish(room, payload.as_ref())
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;

        trace!(channel = %room, receivers, "Published to Redis");
        Ok(())
    }
}

/// Open a pub/sub connection and subscribe it to `channel`. Returns once
/// the server has confirmed the subscription.
async fn subscribe_channel(client: &Client, channel: &str) -> Result<EventStream, BridgeError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BridgeError::Subscribe(e.to_string()))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| BridgeError::Subscribe(e.to_string()))?;
    debug!(channel = %channel, "Subscribed to Redis channel");

    Ok(pubsub
        .into_on_message()
        .map(|message| Ok::<_, BridgeError>(Bytes::copy_from_slice(message.get_payload_bytes())))
        .boxed())
}
