//! JSON-RPC 2.0 wire types and the MCP method names the gateways speak.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined: missing or unknown session, or a transport-level misuse.
pub const SESSION_ERROR: i64 = -32000;

/// Protocol revision announced when the client asks for one we do not know.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const LOG_MESSAGE: &str = "notifications/message";
}

/// Incoming request (carries an id and expects a response).
#[derive(Clone, Debug, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Notification in either direction (no id, no response).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcNotification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Classified inbound message.
#[derive(Clone, Debug)]
pub enum IncomingMessage {
    Request(RpcRequest),
    Notification(RpcNotification),
    /// Reply to a server-initiated request. We never issue any, so these are
    /// accepted and dropped.
    Response(Value),
}

impl IncomingMessage {
    pub fn parse(value: Value) -> Result<Self, ProtocolError> {
        let Some(obj) = value.as_object() else {
            return Err(ProtocolError::InvalidRequest("message must be an object".into()));
        };
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(ProtocolError::InvalidRequest("jsonrpc must be \"2.0\"".into()));
        }

        let has_method = matches!(obj.get("method"), Some(Value::String(_)));
        let has_id = obj.contains_key("id");
        let is_reply = obj.contains_key("result") || obj.contains_key("error");

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value)
                .map(Self::Request)
                .map_err(|e| ProtocolError::InvalidRequest(e.to_string())),
            (true, false) => serde_json::from_value(value)
                .map(Self::Notification)
                .map_err(|e| ProtocolError::InvalidRequest(e.to_string())),
            (false, true) if is_reply => Ok(Self::Response(value)),
            _ => Err(ProtocolError::InvalidRequest("not a JSON-RPC message".into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// MCP log levels (RFC 5424 severities), ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// True when `value` is a single `initialize` request with a protocol version.
pub fn is_initialize_request(value: &Value) -> bool {
    value.get("method").and_then(Value::as_str) == Some(methods::INITIALIZE)
        && value.get("id").is_some()
        && value
            .get("params")
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .is_some()
}

/// True when any message in a single or batched body is an `initialize` request.
pub fn contains_initialize_request(body: &Value) -> bool {
    match body {
        Value::Array(items) => items.iter().any(is_initialize_request),
        other => is_initialize_request(other),
    }
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}
