//! Method-name -> async handler registry and request dispatch.

use crate::protocol::{RpcRequest, RpcResponse, HANDLER_ERROR_CODE};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// A complete response, sent unchanged (custom error codes included).
    Response(RpcResponse),
    /// A result payload; the response is built around it.
    Result(Value),
    /// Nothing to return; answered with `{"Ok": true}`.
    Done,
}

impl From<RpcResponse> for HandlerReply {
    fn from(res: RpcResponse) -> Self {
        HandlerReply::Response(res)
    }
}

impl From<Value> for HandlerReply {
    fn from(value: Value) -> Self {
        HandlerReply::Result(value)
    }
}

impl From<()> for HandlerReply {
    fn from(_: ()) -> Self {
        HandlerReply::Done
    }
}

/// Failure raised by a handler. Missing fields fall back to code 1 and
/// `Failed to handle {method}`.
#[derive(Debug, Default, thiserror::Error)]
#[error("{}", message.as_deref().unwrap_or("handler failed"))]
pub struct HandlerError {
    pub code: Option<i64>,
    pub message: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: Some(message.into()),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: Some(message.into()),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

pub type HandlerResult = Result<HandlerReply, HandlerError>;

/// Type-erased async handler.
pub type MessageHandler = Arc<dyn Fn(RpcRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Registered handlers by method name. Last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing (with a warning) any previous one.
    /// Returns true if a handler was replaced.
    pub async fn add<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let method = method.into();
        let handler: MessageHandler = Arc::new(move |req| handler(req).boxed());
        let replaced = self
            .handlers
            .write()
            .await
            .insert(method.clone(), handler)
            .is_some();
        if replaced {
            log::warn!("handler for method {} already exists, overwriting", method);
        }
        replaced
    }

    pub async fn get(&self, method: &str) -> Option<MessageHandler> {
        self.handlers.read().await.get(method).cloned()
    }

    pub async fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Run the handler for `request` and build exactly one response echoing its id
    /// and method. The handler runs in its own task so a panic only fails this request.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        let Some(handler) = self.get(&method).await else {
            log::warn!("no handler found for method: {}", method);
            return RpcResponse::err(
                id,
                method.clone(),
                HANDLER_ERROR_CODE,
                format!("No handler found for method: {}", method),
            );
        };

        match tokio::spawn(handler(request)).await {
            Ok(Ok(HandlerReply::Response(res))) => res,
            Ok(Ok(HandlerReply::Result(value))) => RpcResponse::ok(id, method, value),
            Ok(Ok(HandlerReply::Done)) => RpcResponse::ok(id, method, json!({ "Ok": true })),
            Ok(Err(e)) => {
                log::warn!("handler for {} failed: {}", method, e);
                let message = e
                    .message
                    .unwrap_or_else(|| format!("Failed to handle {}", method));
                RpcResponse::err(id, method, e.code.unwrap_or(HANDLER_ERROR_CODE), message)
            }
            Err(e) => {
                log::error!("handler for {} aborted: {}", method, e);
                RpcResponse::err(
                    id,
                    method.clone(),
                    HANDLER_ERROR_CODE,
                    format!("Failed to handle {}", method),
                )
            }
        }
    }
}
