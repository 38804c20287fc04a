use rmcp::model::{ErrorCode, ErrorData};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum McpError {
    // Client-side errors
    #[error("client call failed: {0}")]
    ClientCallError(String),
    #[error("client configuration invalid: {0}")]
    ClientConfigError(String),
    #[error("client start failed: {0}")]
    ClientStartError(String),
    #[error("client stop failed: {0}")]
    ClientStopError(String),
    #[error("client is not running: {0}")]
    ClientNotRunning(String),

    // Server-side errors
    #[error("server initialization failed: {0}")]
    ServerInitializationError(String),

    // Common errors
    #[error("io error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    General(String),
}

impl From<McpError> for ErrorData {
    fn from(error: McpError) -> Self {
        ErrorData::new(ErrorCode::INTERNAL_ERROR, error.to_string(), None)
    }
}

impl From<serde_json::Error> for McpError {
    fn from(error: serde_json::Error) -> Self {
        McpError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(error: std::io::Error) -> Self {
        McpError::Io(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for McpError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        McpError::Timeout(error.to_string())
    }
}
