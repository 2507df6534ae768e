// Worker protocol: JSON-RPC 2.0 frames, one per line, over the worker's stdio

use crate::error::{ExecutionFailure, OperationError, UnknownOperationError};
use serde::{Deserialize, Serialize};

/// Method that runs one operation; params are a `TaskDescriptor`
pub const METHOD_RUN: &str = "operation.run";

/// Longest frame accepted from either side
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

// Application error codes
pub const OPERATION_FAILED: i32 = 1;
pub const UNKNOWN_OPERATION: i32 = 2;
pub const OPERATION_PANICKED: i32 = 3;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<serde_json::Value>,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(serde_json::to_value(params)?),
        })
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn parse_error() -> Self {
        Self::custom(-32700, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::custom(-32600, "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::custom(-32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::custom(-32602, message)
    }

    pub fn custom(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Encode a failed attempt for the wire
    pub fn from_failure(failure: &ExecutionFailure) -> Self {
        match failure {
            ExecutionFailure::Operation(e) => Self::custom(OPERATION_FAILED, e.message.clone()),
            ExecutionFailure::UnknownOperation(e) => Self::custom(UNKNOWN_OPERATION, e.0.clone()),
            ExecutionFailure::Panicked(message) => {
                Self::custom(OPERATION_PANICKED, message.clone())
            }
            other => Self::custom(OPERATION_FAILED, other.to_string()),
        }
    }

    /// Decode a failed attempt reported by a worker
    pub fn into_failure(self) -> ExecutionFailure {
        match self.code {
            OPERATION_FAILED => OperationError::new(self.message).into(),
            UNKNOWN_OPERATION => UnknownOperationError(self.message).into(),
            OPERATION_PANICKED => ExecutionFailure::Panicked(self.message),
            code => ExecutionFailure::Transport(format!(
                "worker rejected request ({}): {}",
                code, self.message
            )),
        }
    }
}

/// Successful result of `operation.run`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Messages the operation reported while running
    #[serde(default)]
    pub messages: Vec<String>,
}
