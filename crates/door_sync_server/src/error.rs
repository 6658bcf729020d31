//! Error types for the sync server.

use door_core::CoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong node credentials.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No endpoint at this path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] door_sync_protocol::ProtocolError),

    /// Database error.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns the HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::NotAuthorized(_) => 401,
            ServerError::NotFound(_) => 404,
            ServerError::Core(CoreError::Closed) => 503,
            ServerError::Core(err) if err.is_data_error() => 422,
            ServerError::Core(_) | ServerError::Io(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::NotAuthorized("x".into()).status_code(), 401);
        assert_eq!(ServerError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(
            ServerError::from(CoreError::UnknownTable { table_id: 3 }).status_code(),
            422
        );
        assert_eq!(
            ServerError::from(CoreError::Task("panicked".into())).status_code(),
            500
        );
        assert_eq!(ServerError::from(CoreError::Closed).status_code(), 503);
    }

    #[test]
    fn error_classification() {
        assert!(ServerError::NotFound("/x".into()).is_client_error());
        assert!(!ServerError::from(CoreError::Task("x".into())).is_client_error());
    }
}
