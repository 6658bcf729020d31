//! Storage backend trait definitions.

use crate::error::{StorageError, StorageResult};
use crate::invalidation::InvalidationTracker;
use crate::value::{ResultSet, Value};

/// How a transaction intends to use the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// The transaction only reads. Backends may run these concurrently and
    /// reject writes.
    ReadOnly,
    /// The transaction reads and writes.
    ReadWrite,
}

/// A prepared statement with positional (`?`) parameters.
pub trait Statement {
    /// Executes the statement and returns the number of rows changed.
    fn execute(&mut self, params: &[Value]) -> StorageResult<usize>;

    /// Runs the statement as a query and returns a cursor over its rows.
    fn query(&mut self, params: &[Value]) -> StorageResult<ResultSet>;
}

/// A connection scoped to a single open transaction.
///
/// Connections are only handed out by [`StorageBackend::transaction`]; every
/// statement prepared from one runs inside that transaction.
pub trait Connection {
    /// Prepares a statement.
    fn prepare(&self, sql: &str) -> StorageResult<Box<dyn Statement + '_>>;

    /// Executes one or more statements separated by semicolons, without
    /// parameters.
    fn execute_batch(&self, sql: &str) -> StorageResult<()>;

    /// Returns the rowid assigned by the most recent successful insert.
    fn last_insert_id(&self) -> i64;

    /// Returns the mode this transaction was opened with.
    fn mode(&self) -> TransactionMode;

    /// Records that `table` was modified by this transaction.
    ///
    /// Listeners registered on the backend's [`InvalidationTracker`] for
    /// `table` are notified after the transaction commits.
    fn invalidate(&self, table: &str);
}

/// A relational storage backend.
///
/// # Invariants
///
/// - `transaction` commits if and only if the closure returns `Ok`
/// - Invalidation listeners run after commit, never after a rollback
/// - Backends must be `Send + Sync` so they can be shared between tasks
pub trait StorageBackend: Send + Sync + 'static {
    /// Runs `f` inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns the closure's error (after rolling back), or a storage error
    /// if the transaction could not be opened or committed.
    fn transaction<T, E, F>(&self, mode: TransactionMode, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Connection) -> Result<T, E>,
        E: From<StorageError>;

    /// Executes a batch of schema statements outside any caller transaction.
    fn execute_batch(&self, sql: &str) -> StorageResult<()>;

    /// Returns the tracker notified when write transactions commit.
    fn invalidation_tracker(&self) -> &InvalidationTracker;
}
