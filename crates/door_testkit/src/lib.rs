//! # Door Testkit
//!
//! Test utilities for Door.
//!
//! This crate provides:
//! - The `DiscussionPost` test entity and [`TestNode`] database helpers
//! - Proptest generators for post write sequences
//! - In-process wiring of servers and replication clients
//!
//! ## Usage
//!
//! ```rust,ignore
//! use door_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn replicates() {
//!     let server = TestNode::memory(1);
//!     let client = TestNode::memory(2);
//!     let replication = connect(&client, serve_in_process(&server), client_config(&client));
//!     server.insert_post(&DiscussionPost::new(7, 1));
//!     assert!(wait_until(Duration::from_secs(5), || client.post_version(7) == Some(1)).await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use std::time::Duration;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
