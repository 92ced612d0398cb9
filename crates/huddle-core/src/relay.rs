//! The relay: one connection's lifecycle from authentication to teardown.
//!
//! ```text
//! client ─▶ inbound pump ─▶ persist (spawned) ─▶ bridge.publish
//!                                                     │
//!                                   room feed ◀───────┘  (every instance)
//!                                       │
//!                                       ▼
//!            registry.broadcast ─▶ outbound queue ─▶ outbound pump ─▶ client
//! ```
//!
//! While a room's feed is not subscribed, events published for the room are
//! also broadcast to this instance's members directly; other instances miss
//! them until the feed recovers.
//!
//! A `Relay` serves one kind of room. It owns no transport; callers hand
//! each accepted connection to [`Relay::serve`], which returns once the
//! connection is fully torn down.

use crate::backoff::{BackoffConfig, ExponentialBackoff};
use crate::bridge::IngressBridge;
use crate::connection::{
    ConnectionHandle, ConnectionState, OutboundQueue, DEFAULT_OUTBOUND_CAPACITY,
};
use crate::error::RelayError;
use crate::hooks::{AuthError, Authenticator, PersistenceHook};
use crate::presence::PresenceTracker;
use crate::registry::{RegistryError, RoomRegistry};
use crate::room::{validate_room_id, FeedTask, RoomId, RoomKind, UserId};
use bytes::Bytes;
use futures_util::StreamExt;
use huddle_protocol::{
    decode, decode_auth, encode, encode_control, ControlFrame, Envelope, EnvelopeType,
    MAX_FRAME_SIZE,
};
use huddle_transport::{CloseReason, FrameReader, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

/// Upper bound on flushing already-queued frames after a close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Largest accepted client frame in bytes.
    pub max_frame_size: usize,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// A connection with no inbound traffic for this long is closed.
    pub idle_timeout: Duration,
    /// How long to wait for a first-frame token.
    pub auth_timeout: Duration,
    /// How long a join waits for the room's feed to be subscribed before
    /// announcing.
    pub subscribe_timeout: Duration,
    /// Resubscribe backoff for room feeds.
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Serves connections for one kind of room.
#[derive(Clone)]
pub struct Relay {
    kind: RoomKind,
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    bridge: Arc<dyn IngressBridge>,
    hook: Arc<dyn PersistenceHook>,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Create a relay.
    #[must_use]
    pub fn new(
        kind: RoomKind,
        registry: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        bridge: Arc<dyn IngressBridge>,
        hook: Arc<dyn PersistenceHook>,
        config: RelayConfig,
    ) -> Self {
        info!(kind = kind.as_str(), bridge = bridge.name(), "Creating relay");
        Self {
            kind,
            registry,
            presence,
            bridge,
            hook,
            config: Arc::new(config),
        }
    }

    /// Get the room kind this relay serves.
    #[must_use]
    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// Get the room registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Publish an envelope to a room on every relay instance.
    ///
    /// If the bridge rejects it, or the room's feed is down so the bridge
    /// would not hand it back, the envelope is broadcast to this instance's
    /// members directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub async fn publish(&self, room: &str, envelope: &Envelope) -> Result<(), RelayError> {
        let payload = encode(envelope)?;
        match self.bridge.publish(room, payload.clone()).await {
            Ok(()) if self.registry.feed_live(room) => {}
            Ok(()) => {
                debug!(room = %room, bridge = self.bridge.name(), "Feed down, delivering locally");
                self.registry.broadcast(room, payload);
            }
            Err(err) => {
                warn!(
                    room = %room,
                    bridge = self.bridge.name(),
                    error = %err,
                    "Bridge publish failed, delivering locally"
                );
                self.registry.broadcast(room, payload);
            }
        }
        Ok(())
    }

    /// Run one connection from authentication to teardown.
    ///
    /// The identity comes from `query_token` or, failing that, from a
    /// `{"token": ...}` first frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or authentication fails.
    /// Failures after the join are handled internally.
    pub async fn serve<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        room: &str,
        query_token: Option<&str>,
        authenticator: &dyn Authenticator,
    ) -> Result<(), RelayError>
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        if let Err(reason) = validate_room_id(room) {
            let err = RelayError::Registry(RegistryError::InvalidRoom(reason));
            reject(&mut writer, ControlFrame::error(err.code(), err.to_string()), CloseReason::Error).await;
            return Err(err);
        }

        let (conn, queue) = ConnectionHandle::new(room, self.kind, self.config.outbound_capacity);

        let user = match self.resolve_identity(&mut reader, query_token, authenticator).await {
            Ok(user) => user,
            Err(err) => {
                warn!(room = %room, connection = %conn.id(), error = %err, "Authentication failed");
                let notice = match self.kind {
                    RoomKind::Voice => ControlFrame::auth_failed(err.to_string()),
                    RoomKind::Chat => ControlFrame::error(err.code(), err.to_string()),
                };
                reject(&mut writer, notice, CloseReason::Unauthorized).await;
                conn.close(CloseReason::Unauthorized);
                let _ = conn.mark_closed();
                return Err(err);
            }
        };

        conn.authenticate(user.clone())?;
        self.registry
            .join_with(room, conn.clone(), |name| Some(self.spawn_feed(name)))?;
        conn.transition(ConnectionState::Joined)?;
        info!(room = %room, connection = %conn.id(), user = %user, kind = self.kind.as_str(), "Connection joined");

        let outbound = tokio::spawn(outbound_pump(
            conn.clone(),
            writer,
            queue,
            self.config.ping_interval,
        ));

        self.await_feed(room).await;
        self.announce(&conn, &user).await;
        self.inbound_pump(&conn, &mut reader).await;

        conn.close(CloseReason::Normal);
        self.teardown(&conn, &user).await;

        let reason = conn.close_reason();
        match outbound.await {
            Ok(mut writer) => {
                if let Err(e) = writer.close(reason).await {
                    debug!(connection = %conn.id(), error = %e, "Close failed");
                }
            }
            Err(e) => warn!(connection = %conn.id(), error = %e, "Outbound pump failed"),
        }
        let _ = conn.mark_closed();

        info!(room = %room, connection = %conn.id(), user = %user, reason = reason.as_str(), "Connection closed");
        Ok(())
    }

    async fn resolve_identity<R: FrameReader>(
        &self,
        reader: &mut R,
        query_token: Option<&str>,
        authenticator: &dyn Authenticator,
    ) -> Result<UserId, RelayError> {
        let token = match query_token.filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => {
                let frame = timeout(self.config.auth_timeout, reader.recv())
                    .await
                    .map_err(|_| AuthError::MissingToken)??
                    .ok_or(AuthError::MissingToken)?;
                decode_auth(&frame)
                    .map_err(|_| AuthError::MissingToken)?
                    .token
            }
        };

        Ok(authenticator.authenticate(&token).await?)
    }

    /// Start the room's feed. The returned task reports whether the
    /// subscription is currently up.
    fn spawn_feed(&self, room: &str) -> FeedTask {
        let (live, status) = watch::channel(false);
        let task = tokio::spawn(run_feed(
            self.registry.clone(),
            self.bridge.clone(),
            room.to_string(),
            live,
            self.config.backoff.clone(),
        ));
        debug!(room = %room, bridge = self.bridge.name(), "Started room feed");
        FeedTask::new(task.abort_handle(), status)
    }

    /// Wait until the room's feed is subscribed, so the join and anything
    /// after it comes back through the bridge.
    async fn await_feed(&self, room: &str) {
        let Some(mut status) = self.registry.feed_status(room) else {
            return;
        };
        let subscribed = timeout(self.config.subscribe_timeout, status.wait_for(|live| *live))
            .await
            .is_ok_and(|result| result.is_ok());
        if !subscribed {
            warn!(
                room = %room,
                bridge = self.bridge.name(),
                "Feed not subscribed, delivering locally"
            );
        }
    }

    async fn announce(&self, conn: &Arc<ConnectionHandle>, user: &str) {
        let room = conn.room();

        if self.kind.tracks_presence() {
            deliver_control(conn, &ControlFrame::authenticated(user));
            let _turn = self.presence.turn(room).await;
            let change = self.presence.add_user(room, user);
            deliver(conn, &Envelope::user_list(room, change.users.clone()));

            self.publish_logged(room, &Envelope::join(room, user)).await;
            if change.changed {
                self.publish_logged(room, &Envelope::user_list(room, change.users)).await;
            }
        } else {
            self.publish_logged(room, &Envelope::join(room, user)).await;
        }
    }

    async fn inbound_pump<R: FrameReader>(&self, conn: &Arc<ConnectionHandle>, reader: &mut R) {
        let mut shutdown = conn.shutdown_signal();

        loop {
            let frame = tokio::select! {
                _ = closed(&mut shutdown) => break,
                result = timeout(self.config.idle_timeout, reader.recv()) => match result {
                    Ok(Ok(Some(frame))) => frame,
                    Ok(Ok(None)) => {
                        debug!(connection = %conn.id(), "Client closed");
                        conn.close(CloseReason::Normal);
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!(connection = %conn.id(), error = %e, "Read failed");
                        conn.close(CloseReason::Error);
                        break;
                    }
                    Err(_) => {
                        debug!(connection = %conn.id(), "Idle timeout");
                        conn.close(CloseReason::Idle);
                        break;
                    }
                },
            };

            if let Err(err) = self.route(conn, &frame).await {
                debug!(connection = %conn.id(), error = %err, "Dropped frame");
                deliver_control(conn, &ControlFrame::error(err.code(), err.to_string()));
            }
        }
    }

    /// Validate one client frame, stamp it and hand it on.
    async fn route(&self, conn: &Arc<ConnectionHandle>, frame: &[u8]) -> Result<(), RelayError> {
        // keep-alive
        if frame.is_empty() {
            return Ok(());
        }

        let mut envelope = decode(frame, self.config.max_frame_size)?;

        if envelope.kind.is_server_only() || !self.kind.accepts(envelope.kind) {
            return Err(RelayError::Validation(format!(
                "{} is not accepted in {} rooms",
                envelope.kind,
                self.kind.as_str()
            )));
        }

        if envelope.room.is_empty() {
            envelope.room = conn.room().to_string();
        } else if envelope.room != conn.room() {
            return Err(RelayError::Validation(format!(
                "connection is not in room {}",
                envelope.room
            )));
        }

        if envelope.kind == EnvelopeType::MessageCreate
            && envelope.content.as_deref().map_or(true, str::is_empty)
        {
            return Err(RelayError::Validation("message content is empty".into()));
        }

        let user = conn
            .user_id()
            .ok_or_else(|| RelayError::Validation("connection is not authenticated".into()))?;
        let envelope = envelope.stamp(user);

        if envelope.kind == EnvelopeType::MessageCreate {
            self.spawn_persist(envelope.clone());
        }

        self.publish(conn.room(), &envelope).await
    }

    fn spawn_persist(&self, envelope: Envelope) {
        let hook = self.hook.clone();
        tokio::spawn(async move {
            if let Err(e) = hook.persist(&envelope).await {
                warn!(room = %envelope.room, message = ?envelope.message_id, error = %e, "Persist failed");
            }
        });
    }

    async fn teardown(&self, conn: &Arc<ConnectionHandle>, user: &str) {
        let room = conn.room();
        self.registry.leave(room, conn.id());

        if !self.kind.tracks_presence() {
            self.publish_logged(room, &Envelope::leave(room, user)).await;
            return;
        }

        let _turn = self.presence.turn(room).await;
        let change = self.presence.remove_user(room, user);
        self.publish_logged(room, &Envelope::leave(room, user)).await;
        if change.changed {
            self.publish_logged(room, &Envelope::user_list(room, change.users)).await;
        }
    }

    async fn publish_logged(&self, room: &str, envelope: &Envelope) {
        if let Err(e) = self.publish(room, envelope).await {
            warn!(room = %room, kind = %envelope.kind, error = %e, "Publish failed");
        }
    }
}

/// Send a final notice and close, for connections that never joined.
async fn reject<W: FrameWriter>(writer: &mut W, notice: ControlFrame, reason: CloseReason) {
    if let Ok(frame) = encode_control(&notice) {
        let _ = writer.send(frame).await;
    }
    let _ = writer.close(reason).await;
}

fn deliver(conn: &ConnectionHandle, envelope: &Envelope) {
    match encode(envelope) {
        Ok(frame) => {
            let _ = conn.try_deliver(frame);
        }
        Err(e) => warn!(connection = %conn.id(), error = %e, "Encode failed"),
    }
}

fn deliver_control(conn: &ConnectionHandle, frame: &ControlFrame) {
    match encode_control(frame) {
        Ok(frame) => {
            let _ = conn.try_deliver(frame);
        }
        Err(e) => warn!(connection = %conn.id(), error = %e, "Encode failed"),
    }
}

async fn closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

/// Drain the outbound queue to the transport, pinging on an interval.
/// Returns the writer so the caller can close it after teardown.
async fn outbound_pump<W: FrameWriter>(
    conn: Arc<ConnectionHandle>,
    mut writer: W,
    mut queue: OutboundQueue,
    ping_interval: Duration,
) -> W {
    let mut shutdown = conn.shutdown_signal();
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = closed(&mut shutdown) => break,
            item = queue.recv() => {
                let Some(frame) = item else { break };
                let written = tokio::select! {
                    result = writer.send(frame) => result,
                    _ = closed(&mut shutdown) => break,
                };
                if let Err(e) = written {
                    debug!(connection = %conn.id(), error = %e, "Write failed");
                    conn.close(CloseReason::Error);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = writer.ping().await {
                    debug!(connection = %conn.id(), error = %e, "Ping failed");
                    conn.close(CloseReason::Error);
                    break;
                }
            }
        }
    }

    queue.close();
    if conn.close_reason() != CloseReason::TooSlow {
        let drain = async {
            while let Some(frame) = queue.recv().await {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
        };
        let _ = timeout(DRAIN_TIMEOUT, drain).await;
    }

    writer
}

/// Feed one room from the bridge until aborted, resubscribing with backoff
/// whenever the subscription fails or ends. `live` is true exactly while a
/// subscription is up.
async fn run_feed(
    registry: Arc<RoomRegistry>,
    bridge: Arc<dyn IngressBridge>,
    room: RoomId,
    live: watch::Sender<bool>,
    backoff: BackoffConfig,
) {
    let mut backoff = ExponentialBackoff::with_config(backoff);

    loop {
        match bridge.subscribe(&room).await {
            Ok(mut stream) => {
                live.send_replace(true);
                debug!(room = %room, bridge = bridge.name(), "Feed subscribed");

                while let Some(event) = stream.next().await {
                    match event {
                        Ok(payload) => {
                            backoff.reset();
                            registry.broadcast(&room, payload);
                        }
                        Err(e) => warn!(room = %room, bridge = bridge.name(), error = %e, "Feed error"),
                    }
                }
                live.send_replace(false);
            }
            Err(e) => {
                live.send_replace(false);
                warn!(room = %room, bridge = bridge.name(), error = %e, "Feed subscribe failed");
            }
        }

        let delay = backoff.next_delay();
        warn!(
            room = %room,
            bridge = bridge.name(),
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Feed down, resubscribing"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, EventStream, LocalBridge};
    use crate::hooks::MemoryStore;
    use async_trait::async_trait;
    use huddle_transport::memory::{self, MemoryClient, ServerEvent};
    use tokio::task::JoinHandle;

    struct TestAuth;

    #[async_trait]
    impl Authenticator for TestAuth {
        async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
            token
                .strip_prefix("t-")
                .map(str::to_string)
                .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
        }
    }

    struct FailingBridge;

    /// Accepts publishes but its subscriptions end immediately.
    struct DeafBridge;

    #[async_trait]
    impl IngressBridge for DeafBridge {
        fn name(&self) -> &'static str {
            "deaf"
        }

        async fn subscribe(&self, _room: &str) -> Result<EventStream, BridgeError> {
            Ok(futures_util::stream::empty().boxed())
        }

        async fn publish(&self, _room: &str, _payload: Bytes) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    /// Local bridge that takes a while to acknowledge subscriptions and
    /// records the order of operations.
    struct SlowSubscribeBridge {
        inner: LocalBridge,
        log: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IngressBridge for SlowSubscribeBridge {
        fn name(&self) -> &'static str {
            "slow-subscribe"
        }

        async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let stream = self.inner.subscribe(room).await?;
            self.log.lock().unwrap().push(format!("subscribed {room}"));
            Ok(stream)
        }

        async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
            self.log.lock().unwrap().push(format!("published {room}"));
            self.inner.publish(room, payload).await
        }
    }

    /// Local bridge that holds back empty user lists.
    struct LaggingBridge {
        inner: Arc<LocalBridge>,
    }

    #[async_trait]
    impl IngressBridge for LaggingBridge {
        fn name(&self) -> &'static str {
            "lagging"
        }

        async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
            self.inner.subscribe(room).await
        }

        async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
            let empty_list = decode(&payload, MAX_FRAME_SIZE)
                .ok()
                .and_then(|envelope| envelope.users())
                .is_some_and(|users| users.is_empty());
            if empty_list {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.publish(room, payload).await
        }
    }

    #[async_trait]
    impl IngressBridge for FailingBridge {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn subscribe(&self, _room: &str) -> Result<EventStream, BridgeError> {
            Ok(futures_util::stream::pending().boxed())
        }

        async fn publish(&self, _room: &str, _payload: Bytes) -> Result<(), BridgeError> {
            Err(BridgeError::Publish("down".into()))
        }
    }

    fn relay_with(
        kind: RoomKind,
        bridge: Arc<dyn IngressBridge>,
        store: Arc<MemoryStore>,
        config: RelayConfig,
    ) -> Relay {
        Relay::new(
            kind,
            Arc::new(RoomRegistry::new()),
            Arc::new(PresenceTracker::new()),
            bridge,
            store,
            config,
        )
    }

    fn relay(kind: RoomKind) -> (Relay, Arc<LocalBridge>, Arc<MemoryStore>) {
        let bridge = Arc::new(LocalBridge::new());
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(kind, bridge.clone(), store.clone(), RelayConfig::default());
        (relay, bridge, store)
    }

    fn connect(
        relay: &Relay,
        room: &str,
        token: Option<&str>,
    ) -> (MemoryClient, JoinHandle<Result<(), RelayError>>) {
        connect_buffered(relay, room, token, 64)
    }

    fn connect_buffered(
        relay: &Relay,
        room: &str,
        token: Option<&str>,
        buffer: usize,
    ) -> (MemoryClient, JoinHandle<Result<(), RelayError>>) {
        let (reader, writer, client) = memory::pair(buffer);
        let relay = relay.clone();
        let room = room.to_string();
        let token = token.map(str::to_string);
        let task = tokio::spawn(async move {
            relay
                .serve(reader, writer, &room, token.as_deref(), &TestAuth)
                .await
        });
        (client, task)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_of(client: &mut MemoryClient, kind: EnvelopeType) -> Envelope {
        timeout(Duration::from_secs(2), async {
            loop {
                let frame = client.recv_frame().await.expect("connection closed");
                if let Ok(envelope) = decode(&frame, MAX_FRAME_SIZE) {
                    if envelope.kind == kind {
                        return envelope;
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for envelope")
    }

    async fn next_control(client: &mut MemoryClient) -> ControlFrame {
        timeout(Duration::from_secs(2), async {
            loop {
                let frame = client.recv_frame().await.expect("connection closed");
                if let Ok(control) = serde_json::from_slice::<ControlFrame>(&frame) {
                    return control;
                }
            }
        })
        .await
        .expect("timed out waiting for control frame")
    }

    async fn next_close(client: &mut MemoryClient) -> CloseReason {
        timeout(Duration::from_secs(2), async {
            loop {
                match client.recv().await {
                    Some(ServerEvent::Close(reason)) => return reason,
                    Some(_) => continue,
                    None => panic!("transport dropped without close"),
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    /// Wait for the server to finish with the transport and return the
    /// close reason it sent, if any. No timeout, for paused-clock tests.
    async fn final_close(client: &mut MemoryClient) -> Option<CloseReason> {
        let mut reason = None;
        while let Some(event) = client.recv().await {
            if let ServerEvent::Close(r) = event {
                reason = Some(r);
            }
        }
        reason
    }

    #[tokio::test]
    async fn test_general_scenario() {
        let (relay, _bridge, store) = relay(RoomKind::Chat);
        let (mut c1, t1) = connect(&relay, "general", Some("t-alice"));
        let (mut c2, _t2) = connect(&relay, "general", Some("t-bob"));
        eventually(|| relay.registry().member_count("general") == 2).await;

        c1.send_text(r#"{"type":"message-create","channelId":"general","content":"hi","senderId":"mallory"}"#)
            .await
            .unwrap();

        for client in [&mut c1, &mut c2] {
            let message = next_of(client, EnvelopeType::MessageCreate).await;
            assert_eq!(message.sender.as_deref(), Some("alice"));
            assert_eq!(message.content.as_deref(), Some("hi"));
            assert_eq!(message.room, "general");
            assert!(message.message_id.is_some());
        }

        eventually(|| store.len("general") == 1).await;

        c1.close();
        t1.await.unwrap().unwrap();
        assert_eq!(relay.registry().member_count("general"), 1);

        let leave = next_of(&mut c2, EnvelopeType::Leave).await;
        assert_eq!(leave.sender.as_deref(), Some("alice"));

        assert_eq!(relay.registry().broadcast("general", Bytes::from("{}")), 1);
        assert_eq!(store.len("general"), 1);
    }

    #[tokio::test]
    async fn test_legacy_message_tag_accepted() {
        let (relay, _bridge, _store) = relay(RoomKind::Chat);
        let (mut c1, _t1) = connect(&relay, "general", Some("t-alice"));
        eventually(|| relay.registry().member_count("general") == 1).await;

        c1.send_text(r#"{"type":"MESSAGE_CREATE","content":"legacy"}"#)
            .await
            .unwrap();
        let message = next_of(&mut c1, EnvelopeType::MessageCreate).await;
        assert_eq!(message.content.as_deref(), Some("legacy"));
        assert_eq!(message.room, "general");
    }

    #[tokio::test]
    async fn test_invalid_frames_are_dropped() {
        let (relay, _bridge, store) = relay(RoomKind::Chat);
        let (mut c1, _t1) = connect(&relay, "general", Some("t-alice"));
        eventually(|| relay.registry().member_count("general") == 1).await;

        let rejected = [
            r#"not json"#,
            r#"{"type":"typing","channelId":"general"}"#,
            r#"{"type":"join","channelId":"general"}"#,
            r#"{"type":"offer","channelId":"general"}"#,
            r#"{"type":"message-create","channelId":"random","content":"x"}"#,
            r#"{"type":"message-create","channelId":"general"}"#,
        ];
        for frame in rejected {
            c1.send_text(frame).await.unwrap();
            match next_control(&mut c1).await {
                ControlFrame::Error { code, .. } => assert_eq!(code, "INVALID_FRAME"),
                other => panic!("unexpected control frame {other:?}"),
            }
        }

        // Still open.
        c1.send_text(r#"{"type":"message-create","content":"ok"}"#)
            .await
            .unwrap();
        let message = next_of(&mut c1, EnvelopeType::MessageCreate).await;
        assert_eq!(message.content.as_deref(), Some("ok"));
        eventually(|| store.len("general") == 1).await;
    }

    #[tokio::test]
    async fn test_second_relay_shares_bridge() {
        let bridge = Arc::new(LocalBridge::new());
        let store = Arc::new(MemoryStore::new());
        let a = relay_with(RoomKind::Chat, bridge.clone(), store.clone(), RelayConfig::default());
        let b = relay_with(RoomKind::Chat, bridge.clone(), store.clone(), RelayConfig::default());

        let (mut c1, _t1) = connect(&a, "general", Some("t-alice"));
        let (mut c2, _t2) = connect(&b, "general", Some("t-bob"));
        eventually(|| a.registry().member_count("general") == 1).await;
        eventually(|| b.registry().member_count("general") == 1).await;

        c1.send_text(r#"{"type":"message-create","content":"across"}"#)
            .await
            .unwrap();

        let remote = next_of(&mut c2, EnvelopeType::MessageCreate).await;
        assert_eq!(remote.sender.as_deref(), Some("alice"));
        let local = next_of(&mut c1, EnvelopeType::MessageCreate).await;
        assert_eq!(local.message_id, remote.message_id);

        eventually(|| store.len("general") == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.len("general"), 1);
    }

    #[tokio::test]
    async fn test_bridge_failure_falls_back_to_local() {
        let store = Arc::new(MemoryStore::new());
        let relay = relay_with(
            RoomKind::Chat,
            Arc::new(FailingBridge),
            store,
            RelayConfig::default(),
        );
        let (mut c1, _t1) = connect(&relay, "general", Some("t-alice"));
        let (mut c2, _t2) = connect(&relay, "general", Some("t-bob"));
        eventually(|| relay.registry().member_count("general") == 2).await;

        c1.send_text(r#"{"type":"message-create","content":"local"}"#)
            .await
            .unwrap();
        let message = next_of(&mut c2, EnvelopeType::MessageCreate).await;
        assert_eq!(message.content.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_dead_feed_falls_back_to_local() {
        let config = RelayConfig {
            subscribe_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        let relay = relay_with(
            RoomKind::Chat,
            Arc::new(DeafBridge),
            Arc::new(MemoryStore::new()),
            config,
        );
        let (mut c1, _t1) = connect(&relay, "general", Some("t-alice"));
        let (mut c2, _t2) = connect(&relay, "general", Some("t-bob"));
        eventually(|| relay.registry().member_count("general") == 2).await;
        assert!(!relay.registry().feed_live("general"));

        c1.send_text(r#"{"type":"message-create","content":"hi"}"#)
            .await
            .unwrap();
        let message = next_of(&mut c2, EnvelopeType::MessageCreate).await;
        assert_eq!(message.sender.as_deref(), Some("alice"));
        assert_eq!(message.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_join_announced_after_subscription() {
        let bridge = Arc::new(SlowSubscribeBridge {
            inner: LocalBridge::new(),
            log: std::sync::Mutex::new(Vec::new()),
        });
        let relay = relay_with(
            RoomKind::Chat,
            bridge.clone(),
            Arc::new(MemoryStore::new()),
            RelayConfig::default(),
        );

        let (mut c1, _t1) = connect(&relay, "general", Some("t-alice"));
        let join = next_of(&mut c1, EnvelopeType::Join).await;
        assert_eq!(join.sender.as_deref(), Some("alice"));
        assert!(relay.registry().feed_live("general"));

        let log = bridge.log.lock().unwrap().clone();
        assert_eq!(log, vec!["subscribed general", "published general"]);
    }

    #[tokio::test]
    async fn test_user_lists_published_in_order() {
        let inner = Arc::new(LocalBridge::new());
        let mut observer = inner.subscribe("v1").await.unwrap();
        let relay = relay_with(
            RoomKind::Voice,
            Arc::new(LaggingBridge { inner }),
            Arc::new(MemoryStore::new()),
            RelayConfig::default(),
        );

        let (mut c1, t1) = connect(&relay, "v1", Some("t-a"));
        eventually(|| relay.presence().user_count("v1") == 1).await;

        c1.close();
        let (mut c2, _t2) = connect(&relay, "v1", Some("t-b"));
        t1.await.unwrap().unwrap();
        next_of(&mut c2, EnvelopeType::UserList).await;

        let mut lists = Vec::new();
        while let Ok(Some(Ok(payload))) =
            timeout(Duration::from_millis(500), observer.next()).await
        {
            if let Some(users) = decode(&payload, MAX_FRAME_SIZE).ok().and_then(|e| e.users()) {
                lists.push(users);
            }
        }

        assert_eq!(relay.presence().list_users("v1"), vec!["b"]);
        assert_eq!(lists.last(), Some(&vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn test_overflow_evicts_slow_client() {
        let bridge = Arc::new(LocalBridge::new());
        let config = RelayConfig {
            outbound_capacity: 2,
            ..RelayConfig::default()
        };
        let relay = relay_with(RoomKind::Chat, bridge, Arc::new(MemoryStore::new()), config);

        // The client never reads and its transport holds a single frame.
        let (_slow, task) = connect_buffered(&relay, "general", Some("t-slow"), 1);
        let (mut fast, _fast_task) = connect(&relay, "general", Some("t-fast"));
        eventually(|| relay.registry().member_count("general") == 2).await;

        for i in 0..16 {
            relay
                .registry()
                .broadcast("general", Bytes::from(format!(r#"{{"n":{i}}}"#)));
            tokio::task::yield_now().await;
        }

        eventually(|| relay.registry().member_count("general") == 1).await;
        assert!(relay.registry().stats().evictions >= 1);
        timeout(Duration::from_secs(2), task)
            .await
            .expect("slow connection not torn down")
            .unwrap()
            .unwrap();

        let leave = next_of(&mut fast, EnvelopeType::Leave).await;
        assert_eq!(leave.sender.as_deref(), Some("slow"));
    }

    #[tokio::test]
    async fn test_v1_presence_scenario() {
        let (relay, bridge, _store) = relay(RoomKind::Voice);
        let mut observer = bridge.subscribe("v1").await.unwrap();

        let (mut c1, t1) = connect(&relay, "v1", None);
        c1.send_text(r#"{"token":"t-u"}"#).await.unwrap();
        assert_eq!(next_control(&mut c1).await, ControlFrame::authenticated("u"));
        let list = next_of(&mut c1, EnvelopeType::UserList).await;
        assert_eq!(list.users(), Some(vec!["u".to_string()]));

        let (mut c2, t2) = connect(&relay, "v1", Some("t-u"));
        assert_eq!(next_control(&mut c2).await, ControlFrame::authenticated("u"));
        let list = next_of(&mut c2, EnvelopeType::UserList).await;
        assert_eq!(list.users(), Some(vec!["u".to_string()]));
        assert_eq!(relay.presence().user_count("v1"), 1);
        eventually(|| relay.registry().member_count("v1") == 2).await;

        c1.close();
        t1.await.unwrap().unwrap();
        assert_eq!(relay.presence().user_count("v1"), 1);

        c2.close();
        t2.await.unwrap().unwrap();
        assert_eq!(relay.presence().user_count("v1"), 0);
        assert!(!relay.registry().room_exists("v1"));

        let published: Vec<Envelope> = timeout(Duration::from_secs(2), async {
            let mut seen = Vec::new();
            while let Some(Ok(payload)) = observer.next().await {
                let envelope = decode(&payload, MAX_FRAME_SIZE).unwrap();
                let done = envelope.users() == Some(Vec::new());
                seen.push(envelope);
                if done {
                    return seen;
                }
            }
            seen
        })
        .await
        .expect("no final user-list");

        let lists: Vec<Vec<String>> = published.iter().filter_map(Envelope::users).collect();
        assert_eq!(lists, vec![vec!["u".to_string()], Vec::<String>::new()]);
        let joins = published.iter().filter(|e| e.kind == EnvelopeType::Join).count();
        assert_eq!(joins, 2);
    }

    #[tokio::test]
    async fn test_voice_signals_are_relayed() {
        let (relay, _bridge, store) = relay(RoomKind::Voice);
        let (mut c1, _t1) = connect(&relay, "v2", Some("t-u1"));
        let (mut c2, _t2) = connect(&relay, "v2", Some("t-u2"));
        eventually(|| relay.registry().member_count("v2") == 2).await;

        c1.send_text(r#"{"type":"offer","target":"u2","payload":{"sdp":"v=0"}}"#)
            .await
            .unwrap();
        let offer = next_of(&mut c2, EnvelopeType::Offer).await;
        assert_eq!(offer.sender.as_deref(), Some("u1"));
        assert_eq!(offer.target.as_deref(), Some("u2"));
        assert_eq!(offer.room, "v2");
        assert_eq!(offer.payload, Some(serde_json::json!({"sdp": "v=0"})));

        c1.send_text(r#"{"type":"message-create","content":"nope"}"#)
            .await
            .unwrap();
        assert!(matches!(next_control(&mut c1).await, ControlFrame::Error { .. }));
        assert!(store.is_empty("v2"));
    }

    #[tokio::test]
    async fn test_voice_auth_failure() {
        let (relay, _bridge, _store) = relay(RoomKind::Voice);
        let (mut client, task) = connect(&relay, "v1", Some("bogus"));

        match next_control(&mut client).await {
            ControlFrame::AuthResponse { success, .. } => assert!(!success),
            other => panic!("unexpected control frame {other:?}"),
        }
        assert_eq!(next_close(&mut client).await, CloseReason::Unauthorized);
        assert!(matches!(task.await.unwrap(), Err(RelayError::Auth(_))));
        assert!(!relay.registry().room_exists("v1"));
    }

    #[tokio::test]
    async fn test_chat_auth_failure() {
        let (relay, _bridge, _store) = relay(RoomKind::Chat);
        let (mut client, task) = connect(&relay, "general", None);
        client.send_text(r#"{"type":"message-create"}"#).await.unwrap();

        match next_control(&mut client).await {
            ControlFrame::Error { code, .. } => assert_eq!(code, "UNAUTHORIZED"),
            other => panic!("unexpected control frame {other:?}"),
        }
        assert_eq!(next_close(&mut client).await, CloseReason::Unauthorized);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout() {
        let (relay, _bridge, _store) = relay(RoomKind::Voice);
        let (mut client, task) = connect(&relay, "v1", None);

        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Auth(AuthError::MissingToken))
        ));
        assert_eq!(final_close(&mut client).await, Some(CloseReason::Unauthorized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed() {
        let config = RelayConfig {
            idle_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            ..RelayConfig::default()
        };
        let relay = relay_with(
            RoomKind::Chat,
            Arc::new(LocalBridge::new()),
            Arc::new(MemoryStore::new()),
            config,
        );
        let (mut client, task) = connect(&relay, "general", Some("t-alice"));

        task.await.unwrap().unwrap();
        assert_eq!(final_close(&mut client).await, Some(CloseReason::Idle));
        assert!(!relay.registry().room_exists("general"));
    }

    #[tokio::test]
    async fn test_invalid_room_rejected() {
        let (relay, _bridge, _store) = relay(RoomKind::Chat);
        let (mut client, task) = connect(&relay, "", Some("t-alice"));

        match next_control(&mut client).await {
            ControlFrame::Error { code, .. } => assert_eq!(code, "INVALID_ROOM"),
            other => panic!("unexpected control frame {other:?}"),
        }
        assert!(matches!(task.await.unwrap(), Err(RelayError::Registry(_))));
    }
}
