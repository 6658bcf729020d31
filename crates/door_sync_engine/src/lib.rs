//! # Door Sync Engine
//!
//! Replication client for Door.
//!
//! This crate provides:
//! - [`ReplicationClient`], which keeps the local node and one peer in sync
//! - The [`ReplicationTransport`] abstraction with an HTTP implementation
//!   and a scripted mock
//! - The [`HttpClient`] abstraction with a `reqwest` client and an
//!   in-process loopback client
//!
//! ## Architecture
//!
//! Each direction is a loop of acknowledgment-gated round trips:
//! 1. Send: acknowledge what the peer confirmed, select the next batch of
//!    pending rows in `orUid` order, post it
//! 2. Fetch: acknowledge what was received, ask the peer for its next batch,
//!    apply it with last-writer-wins
//!
//! ## Key Invariants
//!
//! - A queue row is deleted only after the peer acknowledged it
//! - Batches for one peer are delivered in `orUid` order
//! - Redelivery is safe: applying an entity requires a newer version
//! - Network failures are retried; they never stop the client

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod http;
mod state;
mod transport;

pub use client::ReplicationClient;
pub use config::{ReplicationClientConfig, DEFAULT_BATCH_SIZE};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, LoopbackClient, LoopbackServer, Method, ReqwestClient,
};
pub use state::ClientState;
pub use transport::{FetchOutcome, HttpTransport, MockTransport, ReplicationTransport};
