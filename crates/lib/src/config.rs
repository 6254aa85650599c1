//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.wshub/config.json`) and environment.
//! Every field has a default, so a missing file or `{}` is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay listener and routing settings.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Defaults for connectors attaching to the relay (backend and CLI clients).
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// Relay bind, port and per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 24678). Overridden by WSHUB_PORT.
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Messages whose send_timestamp is older than this are logged as stale (still routed).
    #[serde(default = "default_stale_message_ms")]
    pub stale_message_ms: u64,

    /// Outbound frames buffered per connection before the relay starts dropping for that peer.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

/// Heartbeat and reconnect settings for connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Send a ping envelope on every heartbeat tick (default true).
    #[serde(default = "default_ping")]
    pub ping: bool,

    /// Heartbeat period in milliseconds (default 30000).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Minimum time between two connection attempts in milliseconds (default 10000).
    #[serde(default = "default_reconnect_throttle_ms")]
    pub reconnect_throttle_ms: u64,
}

fn default_relay_port() -> u16 {
    24678
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_stale_message_ms() -> u64 {
    1000
}

fn default_send_queue() -> usize {
    256
}

fn default_ping() -> bool {
    true
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_throttle_ms() -> u64 {
    10_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            stale_message_ms: default_stale_message_ms(),
            send_queue: default_send_queue(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ping: default_ping(),
            ping_interval_ms: default_ping_interval_ms(),
            reconnect_throttle_ms: default_reconnect_throttle_ms(),
        }
    }
}

/// Resolve the relay port: env WSHUB_PORT overrides config. Unparsable values are ignored.
pub fn resolve_relay_port(config: &Config) -> u16 {
    std::env::var("WSHUB_PORT")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            match t.parse::<u16>() {
                Ok(p) => Some(p),
                Err(_) => {
                    if !t.is_empty() {
                        log::warn!("ignoring invalid WSHUB_PORT: {}", t);
                    }
                    None
                }
            }
        })
        .unwrap_or(config.relay.port)
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// WebSocket URL for a channel on a relay: `ws://{host}:{port}{path}[?isServer=true]`.
/// A wildcard bind is reached through loopback.
pub fn channel_url(bind: &str, port: u16, path: &str, is_server: bool) -> String {
    let host = match bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "::1" => "[::1]",
        other => other,
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if is_server {
        format!("ws://{}:{}{}?isServer=true", host, port, path)
    } else {
        format!("ws://{}:{}{}", host, port, path)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WSHUB_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".wshub").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
