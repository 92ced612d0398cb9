//! HTTP and WebSocket handlers for the Huddle server.
//!
//! Each enabled room kind gets its own WebSocket route and relay. The
//! connection lifecycle itself lives in [`huddle_core::Relay::serve`]; the
//! handlers only validate the request, upgrade, and hand the socket over.

use crate::auth::{extract_token, JwtAuthenticator};
use crate::config::{BridgeConfig, BridgeKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredBridge};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use huddle_core::room::validate_room_id;
use huddle_core::{
    Authenticator, HistoryStore, IngressBridge, LocalBridge, MemoryStore, NoopHook, PersistenceHook,
    PrefixedBridge, PresenceTracker, Relay, RoomKind, RoomRegistry,
};
use huddle_transport::websocket;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Chat relay, if chat rooms are enabled.
    pub chat: Option<Relay>,
    /// Voice relay, if voice rooms are enabled.
    pub voice: Option<Relay>,
    /// History read path.
    pub history: Arc<dyn HistoryStore>,
    /// Token validation.
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create state backed by an in-memory history store and JWT validation.
    #[must_use]
    pub fn new(config: Config, bridge: Arc<dyn IngressBridge>) -> Self {
        let store = Arc::new(MemoryStore::with_capacity(config.history.capacity_per_room));
        let authenticator = Arc::new(JwtAuthenticator::new(&config.auth));
        Self::with_parts(config, bridge, store.clone(), store, authenticator)
    }

    /// Create state from explicit collaborators. Only chat messages are
    /// persisted; the voice relay gets a [`NoopHook`].
    #[must_use]
    pub fn with_parts(
        config: Config,
        bridge: Arc<dyn IngressBridge>,
        hook: Arc<dyn PersistenceHook>,
        history: Arc<dyn HistoryStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let relay = |kind: RoomKind, prefix: &str, hook: Arc<dyn PersistenceHook>| {
            Relay::new(
                kind,
                Arc::new(RoomRegistry::default()),
                Arc::new(PresenceTracker::new()),
                Arc::new(PrefixedBridge::new(bridge.clone(), prefix)),
                hook,
                config.relay.to_relay_config(),
            )
        };

        let chat = config
            .chat
            .enabled
            .then(|| relay(RoomKind::Chat, &config.chat.prefix, hook));
        let voice = config
            .voice
            .enabled
            .then(|| relay(RoomKind::Voice, &config.voice.prefix, Arc::new(NoopHook)));

        Self {
            config,
            chat,
            voice,
            history,
            authenticator,
        }
    }

    fn relays(&self) -> impl Iterator<Item = &Relay> {
        self.chat.iter().chain(self.voice.iter())
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        for relay in self.relays() {
            relay.registry().close_all();
        }
    }
}

/// Connect the configured upstream bridge, retrying at startup.
///
/// # Errors
///
/// Returns an error if the upstream stays unreachable or the binary was
/// built without support for the configured kind.
pub async fn build_bridge(config: &BridgeConfig) -> Result<Arc<dyn IngressBridge>> {
    match config.kind {
        BridgeKind::Local => Ok(Arc::new(LocalBridge::new())),
        BridgeKind::Redis => connect_redis(config).await,
        BridgeKind::Kafka => connect_kafka(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &BridgeConfig) -> Result<Arc<dyn IngressBridge>> {
    use huddle_bridge::{connect_with_retry, RedisBridge};

    let bridge = connect_with_retry(
        "redis",
        config.connect_attempts,
        config.connect_delay(),
        || RedisBridge::connect(&config.redis_url),
    )
    .await?;
    Ok(Arc::new(bridge))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &BridgeConfig) -> Result<Arc<dyn IngressBridge>> {
    anyhow::bail!("redis bridge requested but the server was built without the `redis` feature")
}

#[cfg(feature = "kafka")]
async fn connect_kafka(config: &BridgeConfig) -> Result<Arc<dyn IngressBridge>> {
    use huddle_bridge::{connect_with_retry, LogBridge, LogBridgeConfig};

    let log_config = LogBridgeConfig {
        brokers: config.kafka_brokers.clone(),
        topic: config.kafka_topic.clone(),
        partition: config.kafka_partition,
        group_id: config.kafka_group_id.clone(),
        ..LogBridgeConfig::default()
    };
    let bridge = connect_with_retry(
        "kafka",
        config.connect_attempts,
        config.connect_delay(),
        || LogBridge::connect(log_config.clone()),
    )
    .await?;
    Ok(Arc::new(bridge))
}

#[cfg(not(feature = "kafka"))]
async fn connect_kafka(_config: &BridgeConfig) -> Result<Arc<dyn IngressBridge>> {
    anyhow::bail!("kafka bridge requested but the server was built without the `kafka` feature")
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/channels/:channelId/messages", get(history_handler))
        .route("/health", get(health_handler));

    if state.chat.is_some() {
        router = router.route(&state.config.chat.path, get(chat_ws_handler));
    }
    if state.voice.is_some() {
        router = router.route(&state.config.voice.path, get(voice_ws_handler));
    }

    router.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the bridge cannot be connected or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let bridge = build_bridge(&config.bridge).await?;
    let bridge: Arc<dyn IngressBridge> = Arc::new(MeteredBridge::new(bridge));
    let state = Arc::new(AppState::new(config.clone(), bridge));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        let registries = state.relays().map(|r| r.registry().clone()).collect();
        tokio::spawn(metrics::sample_registries(
            registries,
            Duration::from_millis(config.metrics.sample_interval_ms),
        ));
    }

    let app = build_router(state.clone());
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    if state.chat.is_some() {
        info!("Chat endpoint: ws://{}{}", addr, config.chat.path);
    }
    if state.voice.is_some() {
        info!("Voice endpoint: ws://{}{}", addr, config.voice.path);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    state.close_all();
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats: Vec<_> = state
        .relays()
        .map(|relay| {
            let stats = relay.registry().stats();
            serde_json::json!({
                "kind": relay.kind().as_str(),
                "rooms": stats.room_count,
                "connections": stats.connection_count,
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "relays": stats,
    }))
}

/// Query parameters of the WebSocket routes.
#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    #[serde(rename = "channelId", alias = "room")]
    pub channel_id: Option<String>,
    pub token: Option<String>,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = Json(serde_json::json!({
        "code": code,
        "message": message.into(),
    }));
    (status, body).into_response()
}

/// The requested room, validated before upgrading.
fn requested_room(query: &RoomQuery) -> Result<String, Response> {
    let room = query.channel_id.as_deref().unwrap_or_default();
    validate_room_id(room)
        .map(|()| room.to_string())
        .map_err(|reason| error_response(StatusCode::BAD_REQUEST, "INVALID_ROOM", reason))
}

async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.chat.clone() {
        Some(relay) => upgrade(ws, relay, query, &headers, state),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn voice_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.voice.clone() {
        Some(relay) => upgrade(ws, relay, query, &headers, state),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn upgrade(
    ws: WebSocketUpgrade,
    relay: Relay,
    query: RoomQuery,
    headers: &HeaderMap,
    state: Arc<AppState>,
) -> Response {
    let room = match requested_room(&query) {
        Ok(room) => room,
        Err(response) => return response,
    };
    let token = extract_token(query.token.as_deref(), headers);

    ws.max_message_size(relay.config().max_frame_size)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new(relay.kind());
            let (reader, writer) = websocket::split(socket);
            if let Err(e) = relay
                .serve(reader, writer, &room, token.as_deref(), state.authenticator.as_ref())
                .await
            {
                metrics::record_error(e.code());
                debug!(room = %room, kind = relay.kind().as_str(), error = %e, "Connection rejected");
            }
        })
}

/// Query parameters of the history route.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub before: Option<DateTime<Utc>>,
    pub token: Option<String>,
}

/// Page through a room's stored messages, newest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(query.token.as_deref(), &headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Missing token");
    };
    if let Err(e) = state.authenticator.authenticate(&token).await {
        return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", e.to_string());
    }
    if let Err(reason) = validate_room_id(&room) {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_ROOM", reason);
    }

    let history = &state.config.history;
    let limit = query
        .limit
        .unwrap_or(history.default_limit)
        .clamp(1, history.max_limit.max(1));

    match state.history.fetch(&room, limit, query.before).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => {
            warn!(room = %room, error = %e, "History fetch failed");
            metrics::record_error("history");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", "History unavailable")
        }
    }
}
