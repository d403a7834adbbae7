use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolbridge_common::ToolbridgeError;

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: RpcError) -> Self {
        Self { jsonrpc: "2.0", id: id.unwrap_or(Value::Null), result: None, error: Some(error) }
    }
}

/// Stable JSON-RPC code table. Standard codes for protocol faults, the
/// -320xx range for upstream API outcomes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;

    pub const UPSTREAM: i64 = -32000;
    pub const AUTH: i64 = -32001;
    pub const TENANT: i64 = -32003;
    pub const NOT_FOUND: i64 = -32004;
    pub const GONE: i64 = -32010;
    pub const CONFLICT: i64 = -32009;
    pub const PRECONDITION: i64 = -32028;
    pub const RATE_LIMITED: i64 = -32029;
    pub const VALIDATION: i64 = -32602;
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("unknown method: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }
}

/// Map an upstream client error onto the stable code table. Retryable
/// conditions were already retried by the client; whatever arrives here is
/// surfaced to the MCP caller.
impl From<ToolbridgeError> for RpcError {
    fn from(e: ToolbridgeError) -> Self {
        let code = match &e {
            ToolbridgeError::Auth(_) => codes::AUTH,
            ToolbridgeError::TenantDenied(_) => codes::TENANT,
            ToolbridgeError::NotFound(_) => codes::NOT_FOUND,
            ToolbridgeError::Gone(_) => codes::GONE,
            ToolbridgeError::EpochMismatch { .. } | ToolbridgeError::VersionMismatch { .. } => {
                codes::CONFLICT
            }
            ToolbridgeError::PreconditionRequired(_) => codes::PRECONDITION,
            ToolbridgeError::RateLimited { .. } => codes::RATE_LIMITED,
            ToolbridgeError::Validation(_) => codes::VALIDATION,
            ToolbridgeError::Transport(_)
            | ToolbridgeError::HttpError(..)
            | ToolbridgeError::Backend(_) => codes::UPSTREAM,
        };
        Self::new(code, e.to_string())
    }
}
