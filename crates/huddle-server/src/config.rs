//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`huddle.toml`, `/etc/huddle/huddle.toml`,
//!   `~/.config/huddle/huddle.toml`)
//! - Environment variables (`HUDDLE_HOST`, `HUDDLE_PORT`,
//!   `HUDDLE_JWT_SECRET`, `HUDDLE_REDIS_URL`), which win over the file

use anyhow::{bail, Context, Result};
use huddle_core::{BackoffConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-connection relay settings.
    #[serde(default)]
    pub relay: RelaySettings,

    /// Upstream bridge.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Chat rooms.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Voice rooms.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Token validation.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Message history.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Per-connection relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Keep-alive ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// First-frame authentication timeout in milliseconds.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u64,

    /// How long a join waits for the room's bridge subscription, in
    /// milliseconds.
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,
}

/// Upstream source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// In-process only; a single instance.
    #[default]
    Local,
    /// Redis pub/sub.
    Redis,
    /// Kafka partition.
    Kafka,
}

/// Upstream bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Which bridge to use.
    #[serde(default)]
    pub kind: BridgeKind,

    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Kafka bootstrap brokers.
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    /// Kafka topic.
    #[serde(default = "default_kafka_topic")]
    pub kafka_topic: String,

    /// Kafka partition to consume.
    #[serde(default)]
    pub kafka_partition: i32,

    /// Kafka consumer group id.
    #[serde(default = "default_kafka_group")]
    pub kafka_group_id: String,

    /// Startup connection attempts.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between startup attempts in milliseconds.
    #[serde(default = "default_connect_retry")]
    pub connect_retry_ms: u64,
}

/// Chat room endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Serve chat rooms.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket path.
    #[serde(default = "default_chat_path")]
    pub path: String,

    /// Bridge channel prefix.
    #[serde(default = "default_chat_prefix")]
    pub prefix: String,
}

/// Voice room endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Serve voice rooms.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket path.
    #[serde(default = "default_voice_path")]
    pub path: String,

    /// Bridge channel prefix.
    #[serde(default = "default_voice_prefix")]
    pub prefix: String,
}

/// Token validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for HS256 tokens. Required; there is no default.
    #[serde(default)]
    pub jwt_secret: String,

    /// Required issuer.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Required audience.
    #[serde(default)]
    pub audience: Option<String>,
}

/// Message history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages kept per room.
    #[serde(default = "default_history_capacity")]
    pub capacity_per_room: usize,

    /// Page size when the request gives none.
    #[serde(default = "default_history_limit")]
    pub default_limit: usize,

    /// Largest page size.
    #[serde(default = "default_history_max_limit")]
    pub max_limit: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Gauge sampling interval in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_ping_interval() -> u64 {
    54_000 // 54 seconds
}

fn default_idle_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_auth_timeout() -> u64 {
    10_000
}

fn default_subscribe_timeout() -> u64 {
    5_000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_topic() -> String {
    "huddle-rooms".to_string()
}

fn default_kafka_group() -> String {
    "huddle".to_string()
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_retry() -> u64 {
    3_000
}

fn default_chat_path() -> String {
    "/ws/chat".to_string()
}

fn default_chat_prefix() -> String {
    "chat:".to_string()
}

fn default_voice_path() -> String {
    "/ws/voice".to_string()
}

fn default_voice_prefix() -> String {
    "voice:".to_string()
}

fn default_history_capacity() -> usize {
    1000
}

fn default_history_limit() -> usize {
    50
}

fn default_history_max_limit() -> usize {
    200
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            relay: RelaySettings::default(),
            bridge: BridgeConfig::default(),
            chat: ChatConfig::default(),
            voice: VoiceConfig::default(),
            auth: AuthConfig::default(),
            history: HistoryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            max_frame_size: default_max_frame_size(),
            ping_interval_ms: default_ping_interval(),
            idle_timeout_ms: default_idle_timeout(),
            auth_timeout_ms: default_auth_timeout(),
            subscribe_timeout_ms: default_subscribe_timeout(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            kind: BridgeKind::default(),
            redis_url: default_redis_url(),
            kafka_brokers: default_kafka_brokers(),
            kafka_topic: default_kafka_topic(),
            kafka_partition: 0,
            kafka_group_id: default_kafka_group(),
            connect_attempts: default_connect_attempts(),
            connect_retry_ms: default_connect_retry(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_chat_path(),
            prefix: default_chat_prefix(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_voice_path(),
            prefix: default_voice_prefix(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: None,
            audience: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity_per_room: default_history_capacity(),
            default_limit: default_history_limit(),
            max_limit: default_history_max_limit(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl RelaySettings {
    /// Build the relay configuration.
    #[must_use]
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.outbound_capacity,
            max_frame_size: self.max_frame_size,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
            backoff: BackoffConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Pause between startup connection attempts.
    #[must_use]
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// Secrets that ship in sample configs and must never sign real tokens.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me", "changeme", "secret"];

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the result fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        let mut config = None;
        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                config = Some(Self::from_file(expanded.as_ref())?);
                break;
            }
        }

        let mut config = config.unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that have no safe default.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWT secret is unset or a known placeholder.
    pub fn validate(&self) -> Result<()> {
        let secret = self.auth.jwt_secret.trim();
        if secret.is_empty() {
            bail!("auth.jwt_secret is not set (set HUDDLE_JWT_SECRET or [auth] jwt_secret)");
        }
        if PLACEHOLDER_SECRETS.contains(&secret) {
            bail!("auth.jwt_secret is a placeholder value; configure a real secret");
        }
        Ok(())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `HUDDLE_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HUDDLE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("HUDDLE_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid HUDDLE_PORT: {port}"))?;
        }
        if let Some(secret) = lookup("HUDDLE_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(url) = lookup("HUDDLE_REDIS_URL") {
            self.bridge.redis_url = url;
            self.bridge.kind = BridgeKind::Redis;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bridge.kind, BridgeKind::Local);
        assert_eq!(config.relay.outbound_capacity, 64);
        assert_eq!(config.chat.path, "/ws/chat");
        assert_eq!(config.voice.prefix, "voice:");
        assert_eq!(config.history.default_limit, 50);
        assert_eq!(config.bridge.connect_attempts, 10);
        assert_eq!(config.bridge.connect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [relay]
            outbound_capacity = 16

            [bridge]
            kind = "kafka"
            kafka_topic = "rooms"

            [voice]
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.relay.outbound_capacity, 16);
        assert_eq!(config.relay.ping_interval_ms, 54_000);
        assert_eq!(config.bridge.kind, BridgeKind::Kafka);
        assert_eq!(config.bridge.kafka_topic, "rooms");
        assert!(!config.voice.enabled);
        assert_eq!(config.voice.path, "/ws/voice");
        assert!(config.chat.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HUDDLE_PORT", "9999"),
            ("HUDDLE_JWT_SECRET", "s3cret"),
            ("HUDDLE_REDIS_URL", "redis://cache:6379"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.port, 9999);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.bridge.kind, BridgeKind::Redis);
        assert_eq!(config.bridge.redis_url, "redis://cache:6379");

        let mut config = Config::default();
        assert!(config
            .apply_overrides(|key| (key == "HUDDLE_PORT").then(|| "eighty".to_string()))
            .is_err());
    }

    #[test]
    fn test_jwt_secret_required() {
        let config = Config::default();
        assert!(config.auth.jwt_secret.is_empty());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.jwt_secret = "change-me".into();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[auth]\nissuer = \"huddle\"").unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .apply_overrides(|key| (key == "HUDDLE_JWT_SECRET").then(|| "s3cret".to_string()))
            .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_config_conversion() {
        let settings = RelaySettings {
            idle_timeout_ms: 1_500,
            ..RelaySettings::default()
        };
        let relay = settings.to_relay_config();
        assert_eq!(relay.idle_timeout, Duration::from_millis(1_500));
        assert_eq!(relay.ping_interval, Duration::from_secs(54));
        assert_eq!(relay.outbound_capacity, 64);
        assert_eq!(relay.subscribe_timeout, Duration::from_secs(5));
    }
}
