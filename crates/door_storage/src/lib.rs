//! # Door Storage
//!
//! Relational storage abstraction for Door.
//!
//! This crate provides the lowest-level storage interface used by the
//! replication core. The core never talks to a SQL engine directly; it goes
//! through three small abstractions:
//!
//! - [`Connection`] - prepares statements inside a transaction
//! - [`Statement`] - a prepared statement with positional parameters
//! - [`ResultSet`] - a forward-only cursor over result rows
//!
//! Transactions are opened through [`StorageBackend::transaction`], which
//! commits when the closure returns `Ok` and rolls back otherwise. Write
//! transactions report the tables they modified to the backend's
//! [`InvalidationTracker`] once they commit.
//!
//! ## Available Backends
//!
//! - [`SqliteBackend`] - SQLite, in-memory or file backed
//!
//! ## Example
//!
//! ```rust
//! use door_storage::{SqliteBackend, StorageBackend, StorageError, TransactionMode, Value};
//!
//! let backend = SqliteBackend::open_in_memory().unwrap();
//! backend.execute_batch("CREATE TABLE Item(id INTEGER PRIMARY KEY, name TEXT)").unwrap();
//!
//! backend
//!     .transaction(TransactionMode::ReadWrite, |conn| {
//!         conn.prepare("INSERT INTO Item(id, name) VALUES (?, ?)")?
//!             .execute(&[Value::Integer(1), Value::from("first")])?;
//!         Ok::<_, StorageError>(())
//!     })
//!     .unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod invalidation;
mod sqlite;
mod value;

pub use backend::{Connection, Statement, StorageBackend, TransactionMode};
pub use error::{StorageError, StorageResult};
pub use invalidation::{InvalidationTracker, ListenerId};
pub use sqlite::SqliteBackend;
pub use value::{ResultSet, Row, Value};
