//! Relay HTTP + WebSocket server (single port).
//!
//! Every upgrade request, on any path, is dispatched to the channel for the
//! normalized path; `isServer=true` in the query marks the channel's server.
//! Plain HTTP requests get a health JSON.

use crate::config::{self, Config, RelayConfig};
use crate::relay::channel::{ChannelSettings, Role};
use crate::relay::connection::serve_connection;
use crate::relay::registry::ChannelRegistry;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::Uri,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the relay: config and the channel registry.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub channels: Arc<ChannelRegistry>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let settings = ChannelSettings {
            stale_after: Duration::from_millis(config.stale_message_ms),
        };
        Self {
            config: Arc::new(config),
            channels: Arc::new(ChannelRegistry::new(settings)),
        }
    }
}

/// Connection-time parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "isServer", default)]
    pub is_server: Option<String>,
}

impl ConnectQuery {
    pub fn role(&self) -> Role {
        if self.is_server.as_deref() == Some("true") {
            Role::Server
        } else {
            Role::Client
        }
    }
}

/// Collapse trailing slashes: `/a/b///` -> `/a/b`; a path of only slashes (or empty) -> `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the router: every path goes to [`dispatch`].
pub fn router(state: RelayState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Upgrade dispatcher. Resolves the channel and hands the socket over; plain
/// HTTP requests get the health JSON.
async fn dispatch(
    State(state): State<RelayState>,
    uri: Uri,
    query: Option<Query<ConnectQuery>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return health(&state).await.into_response();
    };
    let path = normalize_path(uri.path());
    let role = query.map(|Query(q)| q.role()).unwrap_or(Role::Client);
    log::debug!("upgrade {} as {:?}", uri, role);
    let channel = state.channels.get_or_create(&path).await;
    let queue = state.config.send_queue;
    ws.on_upgrade(move |socket| serve_connection(socket, channel, role, queue))
}

async fn health(state: &RelayState) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.port,
        "channels": state.channels.stats().await,
    }))
}

/// Serve the relay on an already bound listener until `shutdown` completes.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("reading listener address")?;
    log::info!("relay listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited")?;
    log::info!("relay stopped");
    Ok(())
}

/// Bind from config and run the relay until SIGINT or SIGTERM. An explicit `port`
/// wins over WSHUB_PORT and the config file.
pub async fn run_relay(config: Config, port: Option<u16>) -> Result<()> {
    let bind = config.relay.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "binding relay to non-loopback address {}; the relay has no authentication",
            bind
        );
    }
    let port = port.unwrap_or_else(|| config::resolve_relay_port(&config));
    let mut relay_config = config.relay;
    relay_config.port = port;

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    serve(listener, RelayState::new(relay_config), shutdown_signal()).await
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping relay");
}
