//! Message envelope protocol shared by the relay, the connector and the RPC backend.
//!
//! Every frame is one JSON object tagged by `type`: `ping`, `pong`, `request`,
//! `response` or `notification`. Any envelope may carry `send_timestamp`
//! (Unix ms) so the relay can flag stale traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle notification sent by the relay when a channel gains its server.
pub const SERVER_READY: &str = "server-ready";
/// Lifecycle notification sent by the relay when a channel loses its server.
pub const SERVER_GONE: &str = "server-gone";

/// Error code of the synthesized response for a request on a channel without server.
pub const NO_SERVER_CODE: i64 = -1;
/// Default error code for handler failures and missing handlers.
pub const HANDLER_ERROR_CODE: i64 = 1;

/// Request correlation token. Any JSON scalar the caller picks.
pub type RequestId = Value;

/// Wire envelope: `{ "type": "...", ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Ping {
        #[serde(
            default,
            deserialize_with = "lenient_timestamp",
            skip_serializing_if = "Option::is_none"
        )]
        send_timestamp: Option<i64>,
    },
    Pong {
        #[serde(
            default,
            deserialize_with = "lenient_timestamp",
            skip_serializing_if = "Option::is_none"
        )]
        send_timestamp: Option<i64>,
    },
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

/// Wire request: `{ "type": "request", "id", "method", "params" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub send_timestamp: Option<i64>,
}

/// Wire response: `{ "type": "response", "id", "method", "result", "error" }`.
/// Exactly one of `result` / `error` is meaningful; both are always serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub send_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Wire notification: `{ "type": "notification", "method", "data" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(default)]
    pub data: Value,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub send_timestamp: Option<i64>,
}

/// `send_timestamp` only feeds the staleness warning, so any value is accepted:
/// numbers (fractional ones truncated) and numeric strings are read as Unix ms,
/// everything else as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_ms))
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    let ms = match value {
        Value::Number(n) => return n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    ms.is_finite().then_some(ms as i64)
}

/// Why a frame could not be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(serde_json::Error),
    #[error("invalid message format: not an object")]
    NotAnObject,
    #[error("unknown message type: {0}")]
    UnknownKind(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

const KINDS: [&str; 5] = ["ping", "pong", "request", "response", "notification"];

/// Parse one text frame. Distinguishes broken JSON, non-objects, unknown kinds and
/// known kinds with missing fields so callers can log what went wrong.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let Some(obj) = value.as_object() else {
        return Err(DecodeError::NotAnObject);
    };
    let kind = obj
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if !KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

impl Envelope {
    pub fn ping() -> Self {
        Envelope::Ping {
            send_timestamp: None,
        }
    }

    pub fn pong() -> Self {
        Envelope::Pong {
            send_timestamp: None,
        }
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Envelope::Notification(RpcNotification {
            method: method.into(),
            data,
            send_timestamp: None,
        })
    }

    /// Wire name of this envelope's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Notification(_) => "notification",
        }
    }

    pub fn send_timestamp(&self) -> Option<i64> {
        match self {
            Envelope::Ping { send_timestamp } | Envelope::Pong { send_timestamp } => {
                *send_timestamp
            }
            Envelope::Request(r) => r.send_timestamp,
            Envelope::Response(r) => r.send_timestamp,
            Envelope::Notification(n) => n.send_timestamp,
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            send_timestamp: None,
        }
    }
}

impl RpcResponse {
    pub fn ok(id: RequestId, method: impl Into<String>, result: Value) -> Self {
        Self {
            id,
            method: method.into(),
            result,
            error: None,
            send_timestamp: None,
        }
    }

    pub fn err(id: RequestId, method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            result: Value::Null,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: Value::Null,
            }),
            send_timestamp: None,
        }
    }

    /// The relay's answer to a request on a channel that has no server.
    pub fn no_server(request: &RpcRequest) -> Self {
        Self::err(
            request.id.clone(),
            request.method.clone(),
            NO_SERVER_CODE,
            "no server",
        )
    }
}

/// Key used to correlate a request id across the relay: the id's JSON text.
pub fn correlation_key(id: &RequestId) -> String {
    id.to_string()
}

/// Current wall clock in Unix milliseconds, for `send_timestamp`.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
