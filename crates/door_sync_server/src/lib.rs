//! # Door Sync Server
//!
//! HTTP replication endpoints for a Door database.
//!
//! This crate provides:
//! - The three replication endpoints (`nodeId`, `message`,
//!   `ackAndGetPendingReplications`)
//! - Node authentication by id and shared secret, with optional
//!   registration of unknown nodes
//! - An axum router and a `serve` loop with graceful shutdown
//!
//! # Architecture
//!
//! The server owns no replication state of its own. It is a thin layer over
//! [`door_core::DoorDatabase`]:
//! - Posted messages go through [`door_core::NodeEventManager`], which
//!   applies them with last-writer-wins and queues them for every other
//!   known node
//! - Fetches acknowledge and select from the caller's outgoing queue in one
//!   transaction
//!
//! ```rust,ignore
//! use door_sync_server::{run, ServerConfig, SyncServer};
//!
//! let events = NodeEventManager::start(db, NodeEventConfig::default())?;
//! let server = Arc::new(SyncServer::new(ServerConfig::default().with_base_path("/db"), events));
//! run(server, async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{authorize, NodeCredentials};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, PendingResponse, RequestHandler};
pub use server::{router, run, serve, Endpoint, ServerRequest, ServerResponse, SyncServer};
