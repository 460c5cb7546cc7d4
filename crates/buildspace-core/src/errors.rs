use serde_json::Value;

use crate::rpc::{
    RpcResponse, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    SESSION_ERROR,
};

/// Malformed or out-of-contract requests. Always answered synchronously with
/// a JSON-RPC error object; never fatal to the process.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Parse error")]
    Parse,
    #[error("Bad Request: Missing or invalid MCP session ID")]
    InvalidSession,
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal server error")]
    Internal,
}

impl ProtocolError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse => PARSE_ERROR,
            Self::InvalidSession => SESSION_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal => INTERNAL_ERROR,
        }
    }

    pub fn to_response(&self, id: Value) -> RpcResponse {
        RpcResponse::error(id, self.code(), self.to_string())
    }
}
