//! JSON-RPC protocol handling
//!
//! Implements the JSON-RPC 2.0 message format used by LSP, including the
//! Content-Length framed wire format for stdio transport. Outgoing messages
//! encode themselves to framed bytes; [`read_frame`] performs the inverse on
//! any buffered async reader.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC / LSP error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// JSON-RPC request message
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    /// Encode to the wire format with Content-Length header
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_body(self)
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_body(self)
    }
}

/// JSON-RPC response (incoming from server)
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Option<String>,
    pub id: Option<i64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC response (outgoing, for answering server-to-client requests)
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponseOut {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorOut>,
}

/// JSON-RPC error for outgoing responses
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorOut {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponseOut {
    /// Create a success response
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create a success response with null result
    pub fn success_null(id: serde_json::Value) -> Self {
        Self::success(id, serde_json::Value::Null)
    }

    /// Create an error response
    pub fn error(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcErrorOut {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_body(self)
    }
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_string(body)
        .map_err(|e| Error::SessionFailure(format!("failed to serialize message: {}", e)))?;
    let message = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    Ok(message.into_bytes())
}

/// Atomic ID generator for JSON-RPC requests
pub struct IdGenerator(AtomicI64);

impl IdGenerator {
    pub fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the Content-Length value out of an accumulated header block
fn parse_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        let line = line.trim();
        if line.to_lowercase().starts_with("content-length:") {
            return line
                .split(':')
                .nth(1)
                .and_then(|len| len.trim().parse().ok());
        }
    }
    None
}

/// Read one framed message from the stream.
///
/// Returns `Ok(None)` on clean end-of-stream at a frame boundary. Any
/// deviation from the wire format (missing or unparsable length header,
/// truncated body, body that is not valid JSON) is a [`Error::MalformedFrame`];
/// the caller must treat it as fatal to the session.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<serde_json::Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = String::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::MalformedFrame(format!("header read failed: {}", e)))?;
        if n == 0 {
            if headers.is_empty() {
                return Ok(None);
            }
            return Err(Error::MalformedFrame(
                "stream ended mid-headers".to_string(),
            ));
        }
        if line.trim().is_empty() {
            break;
        }
        headers.push_str(&line);
    }

    let content_len = parse_content_length(&headers).ok_or_else(|| {
        Error::MalformedFrame(format!("missing or invalid Content-Length in {:?}", headers))
    })?;

    let mut content = vec![0u8; content_len];
    reader
        .read_exact(&mut content)
        .await
        .map_err(|e| Error::MalformedFrame(format!("truncated frame body: {}", e)))?;

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| Error::MalformedFrame(format!("frame body is not valid JSON: {}", e)))
}
