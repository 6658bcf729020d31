//! SQLite storage backend.

use crate::backend::{Connection, Statement, StorageBackend, TransactionMode};
use crate::error::{StorageError, StorageResult};
use crate::invalidation::InvalidationTracker;
use crate::value::{ResultSet, Value};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const STATEMENT_CACHE_CAPACITY: usize = 64;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite-backed storage backend.
///
/// One underlying connection is shared behind a mutex, so transactions are
/// serialized. Transactions are not reentrant: calling
/// [`StorageBackend::transaction`] from inside a transaction closure will
/// deadlock.
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
    tracker: InvalidationTracker,
}

impl SqliteBackend {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = rusqlite::Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn from_connection(conn: rusqlite::Connection) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            tracker: InvalidationTracker::new(),
        })
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl StorageBackend for SqliteBackend {
    fn transaction<T, E, F>(&self, mode: TransactionMode, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Connection) -> Result<T, E>,
        E: From<StorageError>,
    {
        let conn = self.conn.lock();
        let begin = match mode {
            TransactionMode::ReadOnly => "BEGIN DEFERRED",
            TransactionMode::ReadWrite => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(begin).map_err(StorageError::from)?;

        let scoped = SqliteConnection {
            conn: &conn,
            mode,
            invalidated: RefCell::default(),
        };
        let result = f(&scoped);
        let invalidated = scoped.invalidated.into_inner();

        match result {
            Ok(value) => {
                if let Err(err) = conn.execute_batch("COMMIT") {
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        tracing::warn!(error = %rollback, "rollback after failed commit");
                    }
                    return Err(StorageError::from(err).into());
                }
                drop(conn);
                self.tracker.notify(&invalidated);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn invalidation_tracker(&self) -> &InvalidationTracker {
        &self.tracker
    }
}

struct SqliteConnection<'a> {
    conn: &'a rusqlite::Connection,
    mode: TransactionMode,
    invalidated: RefCell<BTreeSet<String>>,
}

impl Connection for SqliteConnection<'_> {
    fn prepare(&self, sql: &str) -> StorageResult<Box<dyn Statement + '_>> {
        let stmt = self.conn.prepare_cached(sql)?;
        Ok(Box::new(SqliteStatement {
            stmt,
            mode: self.mode,
        }))
    }

    fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn invalidate(&self, table: &str) {
        self.invalidated.borrow_mut().insert(table.to_string());
    }
}

struct SqliteStatement<'c> {
    stmt: rusqlite::CachedStatement<'c>,
    mode: TransactionMode,
}

impl Statement for SqliteStatement<'_> {
    fn execute(&mut self, params: &[Value]) -> StorageResult<usize> {
        if self.mode == TransactionMode::ReadOnly && !self.stmt.readonly() {
            return Err(StorageError::ReadOnly);
        }
        let changed = self
            .stmt
            .execute(rusqlite::params_from_iter(params.iter().map(to_sql)))?;
        Ok(changed)
    }

    fn query(&mut self, params: &[Value]) -> StorageResult<ResultSet> {
        if self.mode == TransactionMode::ReadOnly && !self.stmt.readonly() {
            return Err(StorageError::ReadOnly);
        }
        let columns: Arc<[String]> = self
            .stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();

        let mut rows = self
            .stmt
            .query(rusqlite::params_from_iter(params.iter().map(to_sql)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(ResultSet::new(columns, out))
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}
