//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use huddle_core::{BridgeError, EventStream, IngressBridge, RoomKind, RoomRegistry};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const EVICTIONS_TOTAL: &str = "huddle_evictions_total";
    pub const BRIDGE_MESSAGES_TOTAL: &str = "huddle_bridge_messages_total";
    pub const BRIDGE_BYTES_TOTAL: &str = "huddle_bridge_bytes_total";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms with members");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections closed because their outbound queue overflowed"
    );
    metrics::describe_counter!(
        names::BRIDGE_MESSAGES_TOTAL,
        "Messages published to or received from the bridge"
    );
    metrics::describe_counter!(names::BRIDGE_BYTES_TOTAL, "Bytes moved through the bridge");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(kind: RoomKind) {
    counter!(names::CONNECTIONS_TOTAL, "kind" => kind.as_str()).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind.as_str()).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection(kind: RoomKind) {
    gauge!(names::CONNECTIONS_ACTIVE, "kind" => kind.as_str()).decrement(1.0);
}

/// Record a message crossing the bridge.
pub fn record_bridge_message(bytes: usize, direction: &'static str) {
    counter!(names::BRIDGE_MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::BRIDGE_BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    kind: RoomKind,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(kind: RoomKind) -> Self {
        record_connection(kind);
        Self { kind }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.kind);
    }
}

/// Counts traffic through another bridge.
pub struct MeteredBridge {
    inner: Arc<dyn IngressBridge>,
}

impl MeteredBridge {
    #[must_use]
    pub fn new(inner: Arc<dyn IngressBridge>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl IngressBridge for MeteredBridge {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
        let stream = match self.inner.subscribe(room).await {
            Ok(stream) => stream,
            Err(e) => {
                record_error("bridge_subscribe");
                return Err(e);
            }
        };
        Ok(stream
            .inspect(|item| match item {
                Ok(payload) => record_bridge_message(payload.len(), "received"),
                Err(_) => record_error("bridge_receive"),
            })
            .boxed())
    }

    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
        let len = payload.len();
        let result = self.inner.publish(room, payload).await;
        match result {
            Ok(()) => record_bridge_message(len, "published"),
            Err(_) => record_error("bridge_publish"),
        }
        result
    }
}

/// Periodically export registry gauges.
pub async fn sample_registries(registries: Vec<Arc<RoomRegistry>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let (rooms, evictions) = registries.iter().fold((0, 0), |(rooms, evictions), registry| {
            let stats = registry.stats();
            (rooms + stats.room_count, evictions + stats.evictions)
        });
        gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
        counter!(names::EVICTIONS_TOTAL).absolute(evictions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::LocalBridge;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new(RoomKind::Voice);
    }

    #[tokio::test]
    async fn test_metered_bridge_passes_through() {
        let bridge = MeteredBridge::new(Arc::new(LocalBridge::new()));
        assert_eq!(bridge.name(), "local");

        let mut stream = bridge.subscribe("general").await.unwrap();
        bridge.publish("general", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"hi"));
    }
}
