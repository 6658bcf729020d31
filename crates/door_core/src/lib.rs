//! # Door Core
//!
//! Replication core for Door.
//!
//! This crate provides:
//! - Replicated entity metadata and the SQL generated from it
//! - Change capture on the application write path
//! - The node registry and local node identity
//! - Replication data access: pending selection, acknowledgment, apply
//!   with last-writer-wins, and replication trackers
//! - The node event manager, which turns queue inserts into events
//!
//! Everything is stored through `door_storage`; the wire types come from
//! `door_sync_protocol`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_capture;
mod config;
mod database;
mod entities;
mod error;
mod metadata;
mod node_event;
pub mod nodes;
pub mod replication;
pub mod schema;

pub use change_capture::WriteTransaction;
pub use config::{DoorDatabaseConfig, NodeEventConfig};
pub use database::DoorDatabase;
pub use entities::{
    ChangeLog, ChangeType, DoorNode, OutgoingReplication, CHANGE_LOG_TABLE, DOOR_NODE_TABLE,
    OUTGOING_REPLICATION_TABLE,
};
pub use error::{CoreError, CoreResult};
pub use metadata::{
    EntityField, FieldType, MetadataRegistry, RemoteInsertStrategy, ReplicationEntityMetaData,
};
pub use node_event::NodeEventManager;
pub use replication::{ApplyOutcome, PendingBatch};
