//! HTTP paths and header names.
//!
//! All endpoints live under `<database endpoint>/replication/`.

/// Path from a database endpoint to its replication endpoints.
pub const REPLICATION_PATH: &str = "replication";

/// `GET`: responds with the serving node's id in [`HEADER_NODE_ID`].
pub const NODE_ID_PATH: &str = "nodeId";

/// `POST` a [`crate::DoorMessage`], receive a [`crate::ReplicationReceivedAck`].
pub const MESSAGE_PATH: &str = "message";

/// `POST` a [`crate::ReplicationReceivedAck`], receive the next pending
/// [`crate::DoorMessage`] (200) or nothing (204/304).
pub const ACK_AND_GET_PENDING_PATH: &str = "ackAndGetPendingReplications";

/// Header carrying a node id as a decimal string.
pub const HEADER_NODE_ID: &str = "door-node-id";

/// Header carrying the shared secret of the node named in [`HEADER_NODE_ID`].
pub const HEADER_NODE_AUTH: &str = "door-node-auth";

/// Header on a 204 response carrying the server time (epoch millis) at
/// which the pending queue was seen empty.
pub const HEADER_TIMESTAMP: &str = "door-timestamp";

/// Joins a database endpoint and a replication endpoint name.
///
/// ```
/// use door_sync_protocol::{endpoint_url, MESSAGE_PATH};
///
/// assert_eq!(
///     endpoint_url("http://server/db/", MESSAGE_PATH),
///     "http://server/db/replication/message"
/// );
/// assert_eq!(
///     endpoint_url("http://server/db", MESSAGE_PATH),
///     "http://server/db/replication/message"
/// );
/// ```
pub fn endpoint_url(base: &str, name: &str) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        REPLICATION_PATH,
        name
    )
}
