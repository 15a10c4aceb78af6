//! IPC message types for CLI ↔ daemon communication.
//!
//! Uses JSON Lines (newline-delimited JSON) over a Unix stream socket.
//! Field names follow the familiar (id, method, params, result, error) shape
//! but this is not a JSON-RPC 2.0 implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UpdaterError;

/// Request sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    /// Unique request ID for correlating responses.
    pub id: u64,
    /// Method name (e.g., "repo.enqueue_update").
    pub method: String,
    /// Method parameters as JSON value.
    #[serde(default)]
    pub params: Value,
}

impl DaemonRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Create a request with no parameters.
    pub fn no_params(id: u64, method: impl Into<String>) -> Self {
        Self::new(id, method, Value::Object(Default::default()))
    }
}

/// Response sent from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DaemonError>,
}

impl DaemonResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: DaemonError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Error details in a daemon response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DaemonError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Parse error (-32700).
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message)
    }

    /// Invalid request error (-32600).
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message)
    }

    /// Method not found error (-32601).
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(ErrorCode::METHOD_NOT_FOUND, format!("Unknown method: {}", method.into()))
    }

    /// Invalid params error (-32602).
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message)
    }

    /// Internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message)
    }

    /// Turn a code received over the wire back into a library error.
    pub fn into_updater_error(self) -> UpdaterError {
        match self.code {
            ErrorCode::NOT_FOUND => UpdaterError::NotFound(self.message),
            ErrorCode::CONFLICT => UpdaterError::Conflict(self.message),
            ErrorCode::INVALID_PARAMS | ErrorCode::INVALID_REQUEST => UpdaterError::InvalidRequest(self.message),
            _ => UpdaterError::Ipc(format!("{} (code {})", self.message, self.code)),
        }
    }
}

impl From<&UpdaterError> for DaemonError {
    fn from(err: &UpdaterError) -> Self {
        match err {
            UpdaterError::NotFound(_) => Self::new(ErrorCode::NOT_FOUND, err.to_string()),
            UpdaterError::Conflict(_) => Self::new(ErrorCode::CONFLICT, err.to_string()),
            UpdaterError::InvalidRequest(_) => Self::invalid_params(err.to_string()),
            _ => Self::internal_error(err.to_string()),
        }
    }
}

/// Standard error codes.
pub struct ErrorCode;

impl ErrorCode {
    /// Invalid JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal daemon error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Repository is not tracked.
    pub const NOT_FOUND: i32 = 1001;
    /// Operation collides with work in progress.
    pub const CONFLICT: i32 = 1002;
}

/// Known method names as constants.
pub struct Methods;

impl Methods {
    pub const PING: &'static str = "ping";

    // The four service operations
    pub const SCHEDULER_INFO: &'static str = "repo.scheduler_info";
    pub const ENQUEUE_UPDATE: &'static str = "repo.enqueue_update";
    pub const RECLONE: &'static str = "repo.reclone";
    pub const ENQUEUE_CHANGESET_SYNC: &'static str = "changeset.enqueue_sync";

    // Registry
    pub const TRACK: &'static str = "repo.track";
    pub const UNTRACK: &'static str = "repo.untrack";
    pub const LIST: &'static str = "repo.list";

    // Observability
    pub const STATS: &'static str = "scheduler.stats";
}
