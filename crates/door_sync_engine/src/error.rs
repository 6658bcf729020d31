//! Error types for the replication client.

use thiserror::Error;

/// Result type for replication client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while replicating with a peer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request or response body could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] door_sync_protocol::ProtocolError),

    /// The peer answered with a status outside the documented set.
    #[error("unexpected status {status} from {endpoint}")]
    UnexpectedStatus {
        /// Endpoint name.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// Local database error.
    #[error("database error: {0}")]
    Core(#[from] door_core::CoreError),

    /// The operation was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// The client has been closed.
    #[error("replication client is closed")]
    Closed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the same request may succeed when repeated.
    ///
    /// Data errors (unknown tables, malformed entities) are not retryable:
    /// they come from a schema mismatch between the peers.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::UnexpectedStatus { .. } | SyncError::Protocol(_) => true,
            SyncError::Core(err) => !err.is_data_error(),
            SyncError::Cancelled | SyncError::Closed => false,
        }
    }

    /// Returns true for errors that mean the loop should stop.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled | SyncError::Closed | SyncError::Core(door_core::CoreError::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_core::CoreError;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection refused").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::UnexpectedStatus {
            endpoint: "nodeId",
            status: 502
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn data_errors_are_not_retryable() {
        let err = SyncError::from(CoreError::UnknownTable { table_id: 9 });
        assert!(!err.is_retryable());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn cancellation() {
        assert!(SyncError::Closed.is_cancellation());
        assert!(SyncError::from(CoreError::Closed).is_cancellation());
        assert!(!SyncError::transport_retryable("x").is_cancellation());
    }
}
