//! Channel relay: one actor task per path.
//!
//! The actor exclusively owns the server slot, the client set and the pending
//! map; connection tasks talk to it only through [`ChannelHandle`]. Events are
//! processed one at a time, so per-connection message order is preserved.

use crate::protocol::{self, Envelope, RpcResponse, SERVER_GONE, SERVER_READY};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

const INBOX_CAPACITY: usize = 256;

/// Unique id assigned to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role declared at connection time (`isServer=true` or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Sending side of one connection, held by its channel.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::Sender<String>,
    close: Arc<Notify>,
}

/// Receiving side of one connection's outbound queue, drained by its writer task.
pub struct PeerOutbox {
    rx: mpsc::Receiver<String>,
    close: Arc<Notify>,
}

/// What the writer task should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

impl Peer {
    /// Create a peer with a bounded outbound queue.
    pub fn new(queue: usize) -> (Peer, PeerOutbox) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let close = Arc::new(Notify::new());
        (
            Peer {
                tx,
                close: close.clone(),
            },
            PeerOutbox { rx, close },
        )
    }

    /// Queue a frame. Never waits: a full queue drops the frame for this peer only.
    pub fn send(&self, text: String) -> bool {
        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

impl PeerOutbox {
    /// Next thing to write. Yields `Close` once close was requested or every sender is gone.
    pub async fn next(&mut self) -> Outbound {
        tokio::select! {
            biased;
            _ = self.close.notified() => Outbound::Close,
            msg = self.rx.recv() => match msg {
                Some(text) => Outbound::Text(text),
                None => Outbound::Close,
            },
        }
    }
}

/// Snapshot of a channel's state for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub path: String,
    pub has_server: bool,
    pub clients: usize,
    pub pending: usize,
}

/// Per-channel settings taken from the relay config.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub stale_after: Duration,
}

enum ChannelEvent {
    Join {
        id: ConnectionId,
        role: Role,
        peer: Peer,
    },
    Frame {
        id: ConnectionId,
        envelope: Envelope,
        raw: String,
    },
    Leave {
        id: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<ChannelStats>,
    },
}

/// Handle to a running channel actor. Cheap to clone.
#[derive(Clone)]
pub struct ChannelHandle {
    path: Arc<str>,
    tx: mpsc::Sender<ChannelEvent>,
}

impl ChannelHandle {
    /// Spawn the actor for `path`. Must be called inside a Tokio runtime.
    pub fn spawn(path: impl Into<String>, settings: ChannelSettings) -> Self {
        let path: Arc<str> = Arc::from(path.into());
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let actor = ChannelActor {
            path: path.clone(),
            settings,
            server: None,
            clients: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a connection. Returns false if the actor is gone.
    pub async fn join(&self, id: ConnectionId, role: Role, peer: Peer) -> bool {
        self.tx
            .send(ChannelEvent::Join { id, role, peer })
            .await
            .is_ok()
    }

    /// Route one decoded frame; `raw` is forwarded verbatim where routing forwards.
    pub async fn frame(&self, id: ConnectionId, envelope: Envelope, raw: String) -> bool {
        self.tx
            .send(ChannelEvent::Frame { id, envelope, raw })
            .await
            .is_ok()
    }

    pub async fn leave(&self, id: ConnectionId) {
        let _ = self.tx.send(ChannelEvent::Leave { id }).await;
    }

    pub async fn stats(&self) -> Option<ChannelStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ChannelEvent::Stats { reply }).await.ok()?;
        rx.await.ok()
    }
}

struct ServerSlot {
    id: ConnectionId,
    peer: Peer,
    /// request id (JSON text) -> client awaiting the response
    pending: HashMap<String, ConnectionId>,
}

struct ChannelActor {
    path: Arc<str>,
    settings: ChannelSettings,
    server: Option<ServerSlot>,
    clients: HashMap<ConnectionId, Peer>,
}

impl ChannelActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Join { id, role, peer } => self.on_join(id, role, peer),
                ChannelEvent::Frame { id, envelope, raw } => self.on_frame(id, envelope, raw),
                ChannelEvent::Leave { id } => self.on_leave(id),
                ChannelEvent::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
            }
        }
        log::debug!("channel {} actor stopped", self.path);
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            path: self.path.to_string(),
            has_server: self.server.is_some(),
            clients: self.clients.len(),
            pending: self.server.as_ref().map_or(0, |s| s.pending.len()),
        }
    }

    fn on_join(&mut self, id: ConnectionId, role: Role, peer: Peer) {
        match role {
            Role::Server => {
                if let Some(incumbent) = &self.server {
                    log::warn!(
                        "{} already has server {}, refusing server {}",
                        self.path,
                        incumbent.id,
                        id
                    );
                    peer.close();
                    return;
                }
                log::info!("add server {} for {}", id, self.path);
                self.server = Some(ServerSlot {
                    id,
                    peer,
                    pending: HashMap::new(),
                });
                self.broadcast(&lifecycle(SERVER_READY));
            }
            Role::Client => {
                log::info!("add client {} for {}", id, self.path);
                if self.server.is_some() {
                    peer.send(lifecycle(SERVER_READY));
                    log::debug!("sent {} to new client {} for {}", SERVER_READY, id, self.path);
                }
                self.clients.insert(id, peer);
            }
        }
    }

    fn on_leave(&mut self, id: ConnectionId) {
        if self.server.as_ref().is_some_and(|s| s.id == id) {
            if let Some(slot) = self.server.take() {
                log::info!(
                    "server {} left {}, abandoning {} pending request(s)",
                    id,
                    self.path,
                    slot.pending.len()
                );
            }
            self.broadcast(&lifecycle(SERVER_GONE));
        } else if self.clients.remove(&id).is_some() {
            log::info!("client {} left {}", id, self.path);
            if let Some(server) = &mut self.server {
                server.pending.retain(|_, client| *client != id);
            }
        }
    }

    fn sender(&self, id: ConnectionId) -> Option<&Peer> {
        match &self.server {
            Some(server) if server.id == id => Some(&server.peer),
            _ => self.clients.get(&id),
        }
    }

    fn on_frame(&mut self, id: ConnectionId, envelope: Envelope, raw: String) {
        let Some(sender) = self.sender(id).cloned() else {
            log::debug!("{}: frame from unregistered connection {} dropped", self.path, id);
            return;
        };

        if let Some(sent) = envelope.send_timestamp() {
            let age = protocol::now_ms().saturating_sub(sent);
            if age > self.settings.stale_after.as_millis() as i64 {
                log::warn!(
                    "message from {} {} is too old ({} ms): {}",
                    id,
                    self.path,
                    age,
                    raw
                );
            }
        }

        match envelope {
            Envelope::Ping { .. } => {
                sender.send(Envelope::pong().to_json());
            }
            Envelope::Pong { .. } => {
                sender.send(Envelope::ping().to_json());
            }
            Envelope::Request(request) => match &mut self.server {
                Some(server) => {
                    let key = protocol::correlation_key(&request.id);
                    server.pending.insert(key.clone(), id);
                    if !server.peer.send(raw) {
                        log::warn!(
                            "{}: request {} from {} not delivered to server {}",
                            self.path,
                            key,
                            id,
                            server.id
                        );
                        server.pending.remove(&key);
                    }
                }
                None => {
                    log::debug!(
                        "{}: no server for request {} {} from {}",
                        self.path,
                        request.id,
                        request.method,
                        id
                    );
                    sender.send(Envelope::Response(RpcResponse::no_server(&request)).to_json());
                }
            },
            Envelope::Response(response) => {
                let Some(server) = &mut self.server else {
                    log::error!("{}: response {} without server", self.path, response.id);
                    return;
                };
                let key = protocol::correlation_key(&response.id);
                let Some(client_id) = server.pending.remove(&key) else {
                    log::debug!("{}: no pending request for response {}", self.path, key);
                    return;
                };
                match self.clients.get(&client_id) {
                    Some(client) => {
                        client.send(raw);
                    }
                    None => log::debug!("{}: client {} is gone", self.path, client_id),
                }
            }
            Envelope::Notification(_) => {
                for client in self.clients.values() {
                    client.send(raw.clone());
                }
            }
        }
    }

    fn broadcast(&self, text: &str) {
        for client in self.clients.values() {
            client.send(text.to_string());
        }
    }
}

fn lifecycle(method: &str) -> String {
    Envelope::notification(method, Value::Null).to_json()
}
