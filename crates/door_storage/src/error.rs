//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying SQL engine reported an error.
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A column requested by name is not part of the result row.
    #[error("no such column: {0}")]
    NoSuchColumn(String),

    /// A column held a value of an unexpected type.
    #[error("type mismatch for column {column}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        found: &'static str,
    },

    /// A write was attempted inside a read-only transaction.
    #[error("write attempted in read-only transaction")]
    ReadOnly,

    /// The backend has been closed.
    #[error("storage is closed")]
    Closed,
}
