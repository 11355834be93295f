use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::TrophyError;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_STREAM_PATH: &str = "/api/live-events";
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000; // heartbeat frame cadence
pub const MAX_CONNECTION_AGE_MS: u64 = 300_000; // reap connections older than 5 min
pub const RETENTION_MS: u64 = 300_000; // replay window for new subscribers
pub const MAX_RETAINED_EVENTS: usize = 1000;
pub const SEND_BUFFER_FRAMES: usize = 256; // per-connection queue before a write counts as failed

/// Top-level config (trophy.toml + TROPHY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrophyConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Streaming endpoint and per-connection timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Route the SSE endpoint is mounted on.
    #[serde(default = "default_stream_path")]
    pub path: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Connections older than this are closed on the next heartbeat sweep.
    #[serde(default = "default_max_connection_age_ms")]
    pub max_connection_age_ms: u64,
    /// Frames queued per connection before the client counts as unreachable.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

impl StreamConfig {
    /// Never zero: a timer needs a positive period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_millis(self.max_connection_age_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: default_stream_path(),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            max_connection_age_ms: MAX_CONNECTION_AGE_MS,
            send_buffer: SEND_BUFFER_FRAMES,
        }
    }
}

/// Event history kept in memory for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl StoreConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_ms: RETENTION_MS,
            max_events: MAX_RETAINED_EVENTS,
        }
    }
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (GitHub-style X-Hub-Signature-256).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication. Trusted networks only.
    None,
}

/// Configuration for a single webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    /// Identifier used in the route, e.g. "leaderboard" → POST /webhooks/leaderboard.
    pub name: String,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
    pub auth_mode: WebhookAuthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    /// When false the /webhooks/{source} route returns 404.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    HEARTBEAT_INTERVAL_MS
}
fn default_max_connection_age_ms() -> u64 {
    MAX_CONNECTION_AGE_MS
}
fn default_send_buffer() -> usize {
    SEND_BUFFER_FRAMES
}
fn default_retention_ms() -> u64 {
    RETENTION_MS
}
fn default_max_events() -> usize {
    MAX_RETAINED_EVENTS
}

impl TrophyConfig {
    /// Load config from a TOML file with TROPHY_* env var overrides.
    ///
    /// Nested keys use a double underscore: `TROPHY_STORE__RETENTION_MS=60000`.
    /// A missing file is not an error; defaults fill every absent key.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: Self = Self::figment(&path)
            .extract()
            .map_err(|e| TrophyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot run.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.stream.heartbeat_interval_ms == 0 {
            return Err(TrophyError::Config(
                "stream.heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        if !self.stream.path.starts_with('/') {
            return Err(TrophyError::Config(format!(
                "stream.path must start with '/': {:?}",
                self.stream.path
            )));
        }
        Ok(())
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(TrophyConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TROPHY_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.trophy/trophy.toml", home)
}
