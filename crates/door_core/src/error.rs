//! Error types for the replication core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in replication core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] door_storage::StorageError),

    /// Protocol encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] door_sync_protocol::ProtocolError),

    /// JSON error while reading metadata or entities.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No replication metadata is registered for a table id.
    ///
    /// This usually means the peers run different schema versions.
    #[error("unknown table id: {table_id}")]
    UnknownTable {
        /// The table id that was looked up.
        table_id: i32,
    },

    /// Replication metadata is inconsistent.
    #[error("invalid metadata for table {table_id}: {message}")]
    InvalidMetadata {
        /// Table id of the metadata.
        table_id: i32,
        /// What is wrong.
        message: String,
    },

    /// A replicated entity did not match its table's metadata.
    #[error("invalid entity for table {table_id}: {message}")]
    InvalidEntity {
        /// Table id of the entity.
        table_id: i32,
        /// What is wrong.
        message: String,
    },

    /// The node event manager has been closed.
    #[error("node event manager is closed")]
    Closed,

    /// A blocking storage task did not complete.
    #[error("background task failed: {0}")]
    Task(String),
}

impl CoreError {
    /// Creates an invalid entity error.
    pub fn invalid_entity(table_id: i32, message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            table_id,
            message: message.into(),
        }
    }

    /// Creates an invalid metadata error.
    pub fn invalid_metadata(table_id: i32, message: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            table_id,
            message: message.into(),
        }
    }

    /// Returns true for errors caused by data the peers disagree on
    /// (unknown tables, malformed entities).
    ///
    /// These abort the current operation; retrying without a schema change
    /// will fail the same way.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownTable { .. }
                | CoreError::InvalidEntity { .. }
                | CoreError::InvalidMetadata { .. }
        )
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::Task(err.to_string())
    }
}
