//! Error types for cart-surface-bridge.

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Main error type for bridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The listening endpoint could not be bound (port in use, permissions).
    /// Fatal to server start; never retried automatically.
    #[error("failed to bind control-surface endpoint: {0}")]
    Bind(#[source] std::io::Error),

    /// Malformed envelope on the wire.
    #[error("malformed envelope: {0}")]
    Parse(String),

    /// Envelope decoded but carried no `action` field.
    #[error("envelope missing action field")]
    MissingAction,

    /// No handler registered for the action.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// A handler rejected a parameter (out-of-range volume, position, tab).
    #[error("{message}")]
    Validation { code: ErrorCode, message: String },

    /// A handler failed while running.
    #[error("handler execution failed: {0}")]
    Execution(String),

    /// Transport-level failure on a specific connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// The link or channel has been closed.
    #[error("connection closed")]
    Closed,

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl Error {
    /// The wire code an `errorResponse` or failed `${action}Response`
    /// carries for this error.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Error::Parse(_) | Error::Json(_) => ErrorCode::ParseError,
            Error::MissingAction => ErrorCode::MissingAction,
            Error::UnknownAction(_) => ErrorCode::UnknownAction,
            Error::Validation { code, .. } => *code,
            _ => ErrorCode::ExecutionError,
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
