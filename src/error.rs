use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the RPC correlation layer.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response arrived for the call within its timeout window.
    #[error("call '{name}' timed out after {timeout_ms} ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The transport write side is gone; nothing can be sent any more.
    #[error("transport closed")]
    TransportClosed,

    /// The remote side answered with `success = false`.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// Something went wrong serializing a payload.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> RpcError {
        RpcError::Json(err.to_string())
    }
}

/// Errors produced while servicing inbound host calls or running
/// module-supplied callbacks.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// A user-supplied callback failed; carries the callback's own message.
    #[error("{0}")]
    Callback(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("definition '{0}' is not registered")]
    UnknownDefinition(String),

    #[error("learn is not supported for '{0}'")]
    LearnNotSupported(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ModuleError {
    fn from(err: serde_json::Error) -> ModuleError {
        ModuleError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(err: anyhow::Error) -> ModuleError {
        ModuleError::Callback(err.to_string())
    }
}

/// Serialized shape of a failed response payload. `stack` survives the trip
/// so the remote side can log something more useful than a bare message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Best-effort description of a failure payload coming off the wire.
    /// Non-object payloads (including `null`) were serialized as-is by the
    /// remote side and are rendered verbatim.
    pub fn describe(payload: Option<&serde_json::Value>) -> String {
        match payload {
            Some(value) => match serde_json::from_value::<ErrorPayload>(value.clone()) {
                Ok(err) => err.message,
                Err(_) => value.to_string(),
            },
            None => "unknown error".to_string(),
        }
    }
}

impl From<&ModuleError> for ErrorPayload {
    fn from(err: &ModuleError) -> Self {
        ErrorPayload::new(err.to_string())
    }
}
