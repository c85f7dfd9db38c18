//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HOMELINK_LISTEN`, `HOMELINK_ADMIN_KEY`,
//!    `HOMELINK_IDENTITIES_DIR`, `HOMELINK_ACCESS_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `homelink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [connector]
//! invoke_timeout_secs = 30
//! ping_timeout_secs = 10
//! max_frame_size = 16777216               # 16 MiB
//! outbound_queue_size = 256
//! max_consecutive_malformed_frames = 16   # 0 = never close
//! keep_alive_interval_secs = 120          # 0 = disabled
//! keep_alive_timeout_secs = 30           # 0 = wait a full interval
//! device_not_connected_url = "/Cloud/Channel/DeviceNotConnected"
//!
//! [auth]
//! admin_key = "operator-secret"           # omit to disable the statistics API
//!
//! [repository]
//! identities_dir = "/var/lib/homelink/identities"
//! # or inline grants:
//! [[repository.channels]]
//! identity_uid = "dev-1"
//! channel_uid = "default"
//! access_token = "channel-secret"
//!
//! [logging]
//! level = "info"
//!
//! # Optional: only read by `homelink connect`
//! [client]
//! url = "wss://cloud.example.com/Connector"
//! access_token = "channel-secret"
//! forward_to = "http://127.0.0.1:80"
//! json_path = "/api/v1/cloud/invoke-local"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! connect_timeout_secs = 15
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connector::SessionOptions;
use crate::repository::StaticChannel;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "homelink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Controller-side settings for `homelink connect`.
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Session and invoke settings for the cloud side of the tunnel.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Deadline for a tunneled HTTP request or JSON invoke (default 30).
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,
    /// Deadline for `POST /api/v1/cloud/ping` (default 10).
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    /// Largest frame accepted or sent, in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Messages queued per session before senders wait (default 256).
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Consecutive undecodable frames that close a session (default 16, 0 = never).
    #[serde(default = "default_max_malformed")]
    pub max_consecutive_malformed_frames: u32,
    /// Seconds between keep-alive pings to each controller (default 120, 0 = off).
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout_secs: u64,
    /// Where browsers are redirected when their device is offline.
    #[serde(default = "default_device_not_connected_url")]
    pub device_not_connected_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Bearer key for the statistics and sessions API. `None` disables it.
    /// Override with `HOMELINK_ADMIN_KEY`.
    #[serde(default)]
    pub admin_key: Option<String>,
}

/// Where channel access tokens are looked up.
///
/// `identities_dir` wins when set; otherwise the inline `channels` are used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub identities_dir: Option<String>,
    #[serde(default)]
    pub channels: Vec<StaticChannel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Controller-side tunnel client: dials the cloud and serves requests from
/// the local network.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Cloud connector URL (e.g. `wss://cloud.example.com/Connector`).
    pub url: String,
    /// Channel access token. Override with `HOMELINK_ACCESS_TOKEN`.
    pub access_token: String,
    /// Base URL tunneled HTTP requests are forwarded to.
    #[serde(default = "default_forward_to")]
    pub forward_to: String,
    /// Path on `forward_to` receiving JSON invokes.
    #[serde(default = "default_json_path")]
    pub json_path: String,
    /// Seconds before the first reconnect attempt (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Deadline for one forwarded local request (default 30).
    #[serde(default = "default_invoke_timeout")]
    pub request_timeout_secs: u64,
    /// Deadline for the WebSocket handshake with the cloud (default 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_invoke_timeout() -> u64 {
    30
}
fn default_ping_timeout() -> u64 {
    10
}
fn default_max_frame_size() -> usize {
    crate::protocol::codec::DEFAULT_MAX_FRAME_SIZE
}
fn default_outbound_queue_size() -> usize {
    256
}
fn default_max_malformed() -> u32 {
    16
}
fn default_keep_alive_interval() -> u64 {
    120
}
fn default_keep_alive_timeout() -> u64 {
    30
}
fn default_device_not_connected_url() -> String {
    "/Cloud/Channel/DeviceNotConnected".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_forward_to() -> String {
    "http://127.0.0.1:80".to_string()
}
fn default_json_path() -> String {
    "/api/v1/cloud/invoke-local".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_secs: default_invoke_timeout(),
            ping_timeout_secs: default_ping_timeout(),
            max_frame_size: default_max_frame_size(),
            outbound_queue_size: default_outbound_queue_size(),
            max_consecutive_malformed_frames: default_max_malformed(),
            keep_alive_interval_secs: default_keep_alive_interval(),
            keep_alive_timeout_secs: default_keep_alive_timeout(),
            device_not_connected_url: default_device_not_connected_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConnectorConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// A zero `keep_alive_timeout_secs` waits a full interval for the reply.
    pub fn to_session_options(&self) -> SessionOptions {
        let keep_alive_timeout_secs = if self.keep_alive_timeout_secs == 0 {
            self.keep_alive_interval_secs
        } else {
            self.keep_alive_timeout_secs
        };
        SessionOptions {
            max_frame_size: self.max_frame_size,
            outbound_queue_size: self.outbound_queue_size,
            max_consecutive_malformed_frames: self.max_consecutive_malformed_frames,
            keep_alive_interval: (self.keep_alive_interval_secs > 0)
                .then(|| Duration::from_secs(self.keep_alive_interval_secs)),
            keep_alive_timeout: Duration::from_secs(keep_alive_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `homelink.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("HOMELINK_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = var("HOMELINK_ADMIN_KEY") {
            self.auth.admin_key = Some(key);
        }
        if let Some(dir) = var("HOMELINK_IDENTITIES_DIR") {
            self.repository.identities_dir = Some(dir);
        }
        if let (Some(token), Some(client)) = (var("HOMELINK_ACCESS_TOKEN"), self.client.as_mut()) {
            client.access_token = token;
        }
    }
}
