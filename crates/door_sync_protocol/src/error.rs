//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The body was not valid JSON for the expected type.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message carried a `what` code this node does not understand.
    #[error("unknown message kind: {0}")]
    UnknownKind(i32),

    /// A node-identity header was missing or malformed.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}
