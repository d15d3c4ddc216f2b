//! Error types for the agent RPC client.
//!
//! Every failure that can surface to a caller is an [`RpcError`]. Errors raised
//! by inbound handlers are converted to wire-level [`ErrorObject`]s with
//! [`RpcError::to_error_object`] so the remote side always gets a well-formed reply.

use thiserror::Error;

use crate::ipc::message::{error_codes, ErrorObject};

/// Result alias used throughout the crate.
pub type RpcResult<T> = Result<T, RpcError>;

/// Client-side error types.
///
/// These errors provide actionable messages for common failure modes
/// when talking to the agent server.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Failed to connect to the server (spawn ok, but no stream).
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// Protocol-level error (framing, encoding, malformed params).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned a JSON-RPC error response.
    #[error("Server error {code}: {message}")]
    Server {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// The connection was torn down while the request was outstanding.
    #[error("Connection disposed: {0}")]
    Disposed(String),

    /// No live connection is available.
    #[error("Client is not connected")]
    NotConnected,

    /// Handshake found an incompatible server.
    #[error("Protocol version mismatch: expected {expected}, server reported {actual:?}")]
    ProtocolMismatch {
        /// Version this client speaks
        expected: u32,
        /// Version the server reported, if any
        actual: Option<u32>,
    },

    /// The agent CLI process could not be started.
    #[error("Failed to start agent process: {0}")]
    ProcessSpawn(String),

    /// A caller-imposed deadline elapsed.
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Invalid client options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An inbound call named a session that is not registered.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session exists but has no handler for the inbound call.
    #[error("No handler registered for {0}")]
    HandlerNotRegistered(String),

    /// A user-supplied handler failed.
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl RpcError {
    /// Build a handler failure from any displayable error.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        RpcError::Handler(err.to_string())
    }

    /// Convert into the error object sent back to the remote side.
    ///
    /// Server errors raised by a handler pass through untouched; application
    /// errors map to codes in the server-error range so they can be told apart
    /// from malformed calls.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RpcError::Server {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            RpcError::SessionNotFound(_) => {
                ErrorObject::new(error_codes::SESSION_NOT_FOUND, self.to_string())
            }
            RpcError::HandlerNotRegistered(_) => {
                ErrorObject::new(error_codes::HANDLER_NOT_REGISTERED, self.to_string())
            }
            RpcError::Protocol(msg) => ErrorObject::new(error_codes::INVALID_PARAMS, msg.clone()),
            other => ErrorObject::new(error_codes::INTERNAL_ERROR, other.to_string()),
        }
    }

    /// Whether this error means the connection is gone for good.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Disposed(_) | RpcError::NotConnected | RpcError::Io(_)
        )
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                RpcError::ConnectionFailed(err)
            }
            _ => RpcError::Io(err),
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        RpcError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Protocol(format!("JSON error: {}", err))
    }
}
