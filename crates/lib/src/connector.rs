//! Reconnecting WebSocket client with heartbeat.
//!
//! A [`Connector`] opens its connection immediately and keeps a background task
//! that owns the socket. Each heartbeat tick either pings (when connected) or
//! triggers a reconnect; reconnects are throttled to one attempt per window.
//! Sends while disconnected return `false`; nothing is queued across outages.

use crate::config::ConnectorConfig;
use crate::protocol::{self, Envelope};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Close code for an intentional shutdown; the only code that does not trigger a reconnect.
pub const NORMAL_CLOSE: u16 = 1000;
/// Close code reported when the socket ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;
const NO_STATUS_CLOSE: u16 = 1005;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector url is required")]
    EmptyUrl,
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("message parsing error: {0}")]
    Decode(#[from] protocol::DecodeError),
    #[error("binary frame is not utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Heartbeat and reconnect behaviour.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Send a ping envelope on each heartbeat tick while connected.
    pub ping: bool,
    pub ping_interval: Duration,
    /// A reconnect is skipped if the previous attempt started less than this long ago.
    pub reconnect_throttle: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            ping: true,
            ping_interval: Duration::from_secs(30),
            reconnect_throttle: Duration::from_secs(10),
        }
    }
}

impl From<&ConnectorConfig> for ConnectorOptions {
    fn from(c: &ConnectorConfig) -> Self {
        Self {
            ping: c.ping,
            ping_interval: Duration::from_millis(c.ping_interval_ms.max(1)),
            reconnect_throttle: Duration::from_millis(c.reconnect_throttle_ms),
        }
    }
}

/// Callbacks invoked from the connector task. Implementations must not block.
pub trait ConnectorEvents: Send + Sync + 'static {
    fn on_open(&self) {}
    /// Every decoded envelope except `pong`.
    fn on_message(&self, _envelope: Envelope) {}
    fn on_close(&self, _code: u16, _reason: &str) {}
    fn on_error(&self, _error: &ConnectorError) {}
}

/// Connector events that only rely on the connector's own logging.
pub struct NoEvents;

impl ConnectorEvents for NoEvents {}

enum Command {
    Send(String),
    Close(u16),
    Reconnect,
}

/// Handle to a reconnecting connection. Cloning shares the connection; when every
/// handle is dropped the connection is closed with [`NORMAL_CLOSE`].
#[derive(Clone)]
pub struct Connector {
    url: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
}

impl Connector {
    /// Start connecting to `url`. Must be called inside a Tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        options: ConnectorOptions,
        events: Arc<dyn ConnectorEvents>,
    ) -> Result<Self, ConnectorError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ConnectorError::EmptyUrl);
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let url: Arc<str> = Arc::from(url);
        let worker = Worker::new(url.clone(), options, events, connected.clone());
        tokio::spawn(worker.run(cmd_rx));
        Ok(Self {
            url,
            cmd_tx,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a raw text frame. Returns false (and drops the message) while disconnected.
    pub fn send_message(&self, message: impl Into<String>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.cmd_tx.send(Command::Send(message.into())).is_ok()
    }

    /// Serialize and send an envelope. Returns false while disconnected.
    pub fn send_json_message(&self, envelope: &Envelope) -> bool {
        if !self.is_connected() {
            log::error!("websocket {} is not open, dropping {}", self.url, envelope.kind());
            return false;
        }
        match serde_json::to_string(envelope) {
            Ok(text) => self.send_message(text),
            Err(e) => {
                log::error!("failed to serialize json message: {}", e);
                false
            }
        }
    }

    /// Close the connection. The normal code (default) also stops the heartbeat,
    /// so no reconnect follows; any other code is treated like a remote failure.
    pub fn close(&self, code: Option<u16>) {
        let _ = self.cmd_tx.send(Command::Close(code.unwrap_or(NORMAL_CLOSE)));
    }

    /// Request a reconnect, subject to the throttle window.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }
}

/// Tracks when the last connection attempt started.
#[derive(Debug)]
struct ReconnectGate {
    window: Duration,
    last_attempt: Option<Instant>,
}

impl ReconnectGate {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_attempt: None,
        }
    }

    fn begin_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Time since the last attempt if it is still inside the window.
    fn too_soon(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_attempt?);
        (elapsed < self.window).then_some(elapsed)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = Pin<
    Box<
        dyn Future<
                Output = Result<
                    (WsStream, tungstenite::handshake::client::Response),
                    tungstenite::Error,
                >,
            > + Send,
    >,
>;

enum Link {
    Idle,
    Connecting(Handshake),
    Open(WsStream),
}

enum LinkEvent {
    Opened(WsStream),
    ConnectFailed(tungstenite::Error),
    Frame(Message),
    /// Reading from or writing to the open socket failed.
    SocketFailed(tungstenite::Error),
    Ended,
}

async fn next_link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Idle => std::future::pending().await,
        Link::Connecting(handshake) => match handshake.await {
            Ok((ws, _)) => LinkEvent::Opened(ws),
            Err(e) => LinkEvent::ConnectFailed(e),
        },
        Link::Open(ws) => match ws.next().await {
            Some(Ok(msg)) => LinkEvent::Frame(msg),
            Some(Err(e)) => LinkEvent::SocketFailed(e),
            None => LinkEvent::Ended,
        },
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Worker {
    url: Arc<str>,
    options: ConnectorOptions,
    events: Arc<dyn ConnectorEvents>,
    connected: Arc<AtomicBool>,
    gate: ReconnectGate,
    link: Link,
    heartbeat: Option<Interval>,
    /// Close frame received from the peer, reported once the stream ends.
    close_frame: Option<(u16, String)>,
    /// We sent a close frame; the stream ending is the expected outcome.
    closing: bool,
}

impl Worker {
    fn new(
        url: Arc<str>,
        options: ConnectorOptions,
        events: Arc<dyn ConnectorEvents>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            gate: ReconnectGate::new(options.reconnect_throttle),
            options,
            events,
            connected,
            link: Link::Idle,
            heartbeat: None,
            close_frame: None,
            closing: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        self.create_connection();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => self.send_raw(text).await,
                    Some(Command::Close(code)) => self.close(code).await,
                    Some(Command::Reconnect) => self.reconnect().await,
                    None => {
                        self.close(NORMAL_CLOSE).await;
                        break;
                    }
                },
                _ = tick(&mut self.heartbeat) => self.on_heartbeat().await,
                event = next_link_event(&mut self.link) => self.on_link_event(event).await,
            }
        }
        log::debug!("connector for {} stopped", self.url);
    }

    fn create_connection(&mut self) {
        log::info!("connecting to {}", self.url);
        self.gate.begin_attempt(Instant::now());
        self.close_frame = None;
        self.closing = false;
        let url = self.url.to_string();
        self.link = Link::Connecting(Box::pin(tokio_tungstenite::connect_async(url)));
        self.start_heartbeat();
    }

    fn start_heartbeat(&mut self) {
        let period = self.options.ping_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat = None;
    }

    fn drop_link(&mut self) {
        self.link = Link::Idle;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        matches!(self.link, Link::Open(_))
    }

    async fn on_heartbeat(&mut self) {
        if !self.is_open() {
            self.reconnect().await;
        } else if self.options.ping {
            self.send_raw(Envelope::ping().to_json()).await;
        }
    }

    async fn send_raw(&mut self, text: String) {
        let Link::Open(ws) = &mut self.link else {
            log::debug!("{} not connected, dropping outbound frame", self.url);
            return;
        };
        if let Err(e) = ws.send(Message::Text(text)).await {
            log::warn!("{} send failed: {}", self.url, e);
            self.on_link_event(LinkEvent::SocketFailed(e)).await;
        }
    }

    async fn reconnect(&mut self) {
        if let Some(elapsed) = self.gate.too_soon(Instant::now()) {
            log::info!(
                "do not reconnect {} for a short period of time: {} ms",
                self.url,
                elapsed.as_millis()
            );
            return;
        }
        let was_open = if let Link::Open(ws) = &mut self.link {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "reconnect".into(),
            };
            if let Err(e) = ws.close(Some(frame)).await {
                log::debug!("{} close before reconnect failed: {}", self.url, e);
            }
            true
        } else {
            false
        };
        self.drop_link();
        if was_open {
            self.events.on_close(NORMAL_CLOSE, "reconnect");
        }
        self.stop_heartbeat();
        self.create_connection();
    }

    async fn close(&mut self, code: u16) {
        if code == NORMAL_CLOSE {
            self.stop_heartbeat();
        }
        match &mut self.link {
            Link::Open(ws) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: "".into(),
                };
                if let Err(e) = ws.close(Some(frame)).await {
                    log::debug!("{} close failed: {}", self.url, e);
                }
                // end of stream arrives through the read loop and reports our code
                self.closing = true;
                self.close_frame = Some((code, String::new()));
                self.connected.store(false, Ordering::SeqCst);
            }
            Link::Connecting(_) => {
                self.drop_link();
                self.on_closed(code, "").await;
            }
            Link::Idle => {}
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(ws) => {
                self.link = Link::Open(ws);
                self.connected.store(true, Ordering::SeqCst);
                log::info!("connected to {}", self.url);
                self.events.on_open();
            }
            LinkEvent::ConnectFailed(e) => {
                self.drop_link();
                log::error!("{} error: {}", self.url, e);
                self.reconnect().await;
                self.events.on_error(&ConnectorError::Transport(e));
            }
            LinkEvent::Frame(Message::Text(text)) => self.on_text(&text),
            LinkEvent::Frame(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => self.on_text(&text),
                Err(e) => {
                    log::error!("{} message parsing error: {}", self.url, e);
                    self.events.on_error(&ConnectorError::InvalidUtf8(e));
                }
            },
            LinkEvent::Frame(Message::Close(_)) if self.closing => {}
            LinkEvent::Frame(Message::Close(frame)) => {
                self.close_frame = Some(match frame {
                    Some(f) => (u16::from(f.code), f.reason.into_owned()),
                    None => (NO_STATUS_CLOSE, String::new()),
                });
            }
            LinkEvent::Frame(_) => {}
            LinkEvent::SocketFailed(e) if self.closing => {
                log::debug!("{} socket error after close: {}", self.url, e);
                self.drop_link();
                let (code, reason) = self
                    .close_frame
                    .take()
                    .unwrap_or((NORMAL_CLOSE, String::new()));
                self.on_closed(code, &reason).await;
            }
            LinkEvent::SocketFailed(e) => {
                self.drop_link();
                log::error!("{} error: {}", self.url, e);
                self.reconnect().await;
                self.events.on_error(&ConnectorError::Transport(e));
                let (code, reason) = self
                    .close_frame
                    .take()
                    .unwrap_or((ABNORMAL_CLOSE, String::new()));
                self.events.on_close(code, &reason);
            }
            LinkEvent::Ended => {
                self.drop_link();
                let (code, reason) = self
                    .close_frame
                    .take()
                    .unwrap_or((ABNORMAL_CLOSE, String::new()));
                self.on_closed(code, &reason).await;
            }
        }
    }

    async fn on_closed(&mut self, code: u16, reason: &str) {
        log::info!("{} closed, code: {}, reason: {}", self.url, code, reason);
        if code != NORMAL_CLOSE {
            self.reconnect().await;
        } else {
            self.stop_heartbeat();
        }
        self.events.on_close(code, reason);
    }

    fn on_text(&self, text: &str) {
        match protocol::decode(text) {
            Ok(Envelope::Pong { .. }) => log::trace!("pong received from {}", self.url),
            Ok(envelope) => self.events.on_message(envelope),
            Err(e) => {
                log::error!("{} message parsing error: {}", self.url, e);
                self.events.on_error(&ConnectorError::Decode(e));
            }
        }
    }
}
