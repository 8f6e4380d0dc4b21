use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC error object, forwarded verbatim between peers so that server
/// errors reach clients with the same code, message and data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        ResponseError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Well-known JSON-RPC / LSP error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// LSP: the server has not been initialized yet.
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    /// LSP: the request was cancelled via `$/cancelRequest`.
    pub const REQUEST_CANCELLED: i64 = -32800;
    /// LSP: the content the request referred to changed before it ran.
    pub const CONTENT_MODIFIED: i64 = -32801;
}

/// Broker error taxonomy. `Clone` is required because cached responses are
/// shared futures observed by several callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("expected exactly one handler to answer, got {0}")]
    HandlerCountMismatch(usize),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("peer responded with an error: {0}")]
    Response(ResponseError),
}

impl Error {
    /// Maps a broker error onto the JSON-RPC error object sent to a peer.
    /// `Response` errors pass through untouched.
    pub fn into_response_error(self) -> ResponseError {
        match self {
            Error::Response(err) => err,
            Error::MethodNotFound(method) => ResponseError::method_not_found(&method),
            Error::ConnectionClosed => {
                ResponseError::new(codes::REQUEST_CANCELLED, "connection closed")
            }
            other => ResponseError::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
