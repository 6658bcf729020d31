//! # Door Sync Protocol
//!
//! Wire types and JSON codecs for Door replication.
//!
//! This crate provides:
//! - [`DoorMessage`], the envelope carrying replicated entities between nodes
//! - [`ReplicationReceivedAck`], the list of `orUid`s a receiver has applied
//! - [`NodeEvent`], the in-process notification that a node has pending data
//! - [`ReplicationTracker`], a `(primaryKey, versionId)` pair used to compare
//!   versions without transferring entities
//! - Endpoint paths and header names shared by clients and servers
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod endpoints;
mod error;
mod event;
mod messages;
mod tracker;

pub use endpoints::{
    endpoint_url, ACK_AND_GET_PENDING_PATH, HEADER_NODE_AUTH, HEADER_NODE_ID, HEADER_TIMESTAMP,
    MESSAGE_PATH, NODE_ID_PATH, REPLICATION_PATH,
};
pub use error::{ProtocolError, ProtocolResult};
pub use event::NodeEvent;
pub use messages::{DoorMessage, DoorReplicationEntity, MessageKind, ReplicationReceivedAck};
pub use tracker::ReplicationTracker;
