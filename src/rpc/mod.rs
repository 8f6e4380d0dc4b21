//! JSON-RPC 2.0 plumbing shared by the server link and every client link.
//!
//! The broker is transport-agnostic: anything that splits into an
//! `AsyncRead` and an `AsyncWrite` (stdio pipes, TCP, unix sockets, the
//! WebSocket adapter in `main`) can carry a [`Connection`].

mod connection;
mod framing;

pub use connection::{CloseCause, Connection, PendingRequest};
pub use framing::{read_message, write_message};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResponseError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method of the cancellation notification defined by the LSP base protocol.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// A request id. The broker issues numeric ids; string ids from peers are
/// preserved so responses round-trip bit-exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// One decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: std::result::Result<Value, ResponseError>,
    },
}

/// Serde view of the wire object; `Message` is derived from which fields are
/// present, the way every JSON-RPC peer in the wild does it.
#[derive(Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ResponseError>,
}

impl Message {
    pub fn decode(payload: &[u8]) -> std::result::Result<Message, String> {
        let raw: RawMessage =
            serde_json::from_slice(payload).map_err(|e| format!("malformed JSON-RPC payload: {}", e))?;
        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Message::Request {
                id,
                method,
                params: raw.params,
            }),
            (None, Some(method)) => Ok(Message::Notification {
                method,
                params: raw.params,
            }),
            (Some(id), None) => {
                let result = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, result })
            }
            (None, None) => Err("message carries neither method nor id".to_string()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let raw = match self {
            Message::Request { id, method, params } => RawMessage {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(id.clone()),
                method: Some(method.clone()),
                params: params.clone(),
                result: None,
                error: None,
            },
            Message::Notification { method, params } => RawMessage {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: None,
                method: Some(method.clone()),
                params: params.clone(),
                result: None,
                error: None,
            },
            Message::Response { id, result } => match result {
                Ok(value) => RawMessage {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: Some(id.clone()),
                    method: None,
                    params: None,
                    // A success response must carry `result`, even when null.
                    result: Some(value.clone()),
                    error: None,
                },
                Err(error) => RawMessage {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id: Some(id.clone()),
                    method: None,
                    params: None,
                    result: None,
                    error: Some(error.clone()),
                },
            },
        };
        let mut bytes = serde_json::to_vec(&raw).expect("JSON-RPC message serialization is infallible");
        // `result: null` is stripped by skip_serializing_if; patch it back in
        // for success responses so conformant peers accept them.
        if let Message::Response { result: Ok(value), .. } = self {
            if value.is_null() {
                let mut object: Value =
                    serde_json::from_slice(&bytes).expect("round-trip of encoded message");
                object["result"] = Value::Null;
                bytes = serde_json::to_vec(&object).expect("JSON-RPC message serialization is infallible");
            }
        }
        bytes
    }
}
