//! Backend attached to one channel as its server, answering requests through a
//! [`HandlerRegistry`] and broadcasting notifications.

use crate::connector::{Connector, ConnectorError, ConnectorEvents, ConnectorOptions};
use crate::protocol::{Envelope, RpcRequest};
use crate::rpc::registry::{HandlerRegistry, HandlerResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Forwards requests from the connector task to the dispatch loop.
struct BackendEvents {
    requests: mpsc::UnboundedSender<RpcRequest>,
}

impl ConnectorEvents for BackendEvents {
    fn on_open(&self) {
        log::info!("backend attached");
    }

    fn on_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request(req) => {
                let _ = self.requests.send(req);
            }
            other => log::debug!("backend ignoring {}", other.kind()),
        }
    }

    fn on_close(&self, code: u16, reason: &str) {
        log::info!("backend detached, code: {}, reason: {}", code, reason);
    }
}

/// RPC facade: a connector in the server role plus the handler registry.
/// Each request is handled in its own task, so responses may complete out of order.
pub struct RpcBackend {
    connector: Connector,
    handlers: Arc<HandlerRegistry>,
    dispatcher: JoinHandle<()>,
}

impl RpcBackend {
    /// Connect to a server URL (one carrying `isServer=true`) and start dispatching.
    pub fn connect(url: impl Into<String>, options: ConnectorOptions) -> Result<Self, ConnectorError> {
        Self::with_handlers(url, options, Arc::new(HandlerRegistry::new()))
    }

    /// Like [`RpcBackend::connect`] with a pre-populated registry.
    pub fn with_handlers(
        url: impl Into<String>,
        options: ConnectorOptions,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self, ConnectorError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RpcRequest>();
        let connector = Connector::connect(url, options, Arc::new(BackendEvents { requests: tx }))?;

        let dispatcher = {
            let connector = connector.clone();
            let handlers = handlers.clone();
            tokio::spawn(async move {
                while let Some(req) = rx.recv().await {
                    let connector = connector.clone();
                    let handlers = handlers.clone();
                    tokio::spawn(async move {
                        let method = req.method.clone();
                        let res = handlers.dispatch(req).await;
                        if !connector.send_json_message(&Envelope::Response(res)) {
                            log::warn!("response for {} dropped, connection is down", method);
                        }
                    });
                }
            })
        };

        Ok(Self {
            connector,
            handlers,
            dispatcher,
        })
    }

    /// Register a handler; an existing one for `method` is replaced.
    pub async fn add_message_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.add(method, handler).await;
    }

    /// Fire-and-forget broadcast to every client of the channel. False if the
    /// payload could not be serialized or the connection is down.
    pub fn send_notification(&self, method: &str, data: impl Serialize) -> bool {
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                log::error!("failed to serialize notification {}: {}", method, e);
                return false;
            }
        };
        self.connector
            .send_json_message(&Envelope::notification(method, data))
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Detach from the channel with the normal close code.
    pub fn close(&self) {
        self.connector.close(None);
    }
}

impl Drop for RpcBackend {
    fn drop(&mut self) {
        // the dispatch loop holds a connector handle; stop it so the connection can close
        self.dispatcher.abort();
    }
}
