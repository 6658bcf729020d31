//! Node authentication.
//!
//! Every replication request names the calling node in the
//! `door-node-id` header and carries its shared secret in
//! `door-node-auth`. A known node must present the secret it was
//! registered with. An unknown node is registered on first contact when
//! the server allows it; its secret is then the one it presented. A node
//! this server registered itself while connecting out to it has no secret
//! yet and keeps the first one it presents.

use crate::error::{ServerError, ServerResult};
use door_core::{DoorDatabase, DoorNode};
use door_storage::StorageBackend;

/// Credentials presented by a calling node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCredentials {
    /// Id of the calling node.
    pub node_id: i64,
    /// Shared secret of the calling node.
    pub auth: String,
}

impl NodeCredentials {
    /// Parses credentials from the raw header values.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] if either header is missing,
    /// the id is not an integer or the secret is empty.
    pub fn from_headers(node_id: Option<&str>, auth: Option<&str>) -> ServerResult<Self> {
        let node_id = node_id
            .ok_or_else(|| ServerError::NotAuthorized("missing node id".into()))?
            .trim()
            .parse::<i64>()
            .map_err(|_| ServerError::NotAuthorized("node id is not an integer".into()))?;
        let auth = auth.unwrap_or_default();
        if auth.is_empty() {
            return Err(ServerError::NotAuthorized(format!(
                "missing auth for node {node_id}"
            )));
        }
        Ok(Self {
            node_id,
            auth: auth.to_owned(),
        })
    }
}

/// Checks credentials against the node registry.
///
/// Blocking; call from a blocking task.
///
/// # Errors
///
/// Returns [`ServerError::NotAuthorized`] if the node claims the server's own
/// id or presents the wrong secret. Unknown nodes are rejected while
/// registration is off.
pub fn authorize<B: StorageBackend>(
    db: &DoorDatabase<B>,
    credentials: &NodeCredentials,
    auto_register: bool,
) -> ServerResult<()> {
    if credentials.node_id == db.local_node_id() {
        return Err(ServerError::NotAuthorized(format!(
            "node {} is the local node",
            credentials.node_id
        )));
    }

    match db.find_node(credentials.node_id)? {
        Some(node) if !node.auth.is_empty() && node.auth == credentials.auth => Ok(()),
        Some(node) if node.auth.is_empty() => {
            if db.adopt_node_auth(credentials.node_id, &credentials.auth)? {
                Ok(())
            } else {
                Err(ServerError::NotAuthorized(format!(
                    "wrong auth for node {}",
                    credentials.node_id
                )))
            }
        }
        Some(_) => Err(ServerError::NotAuthorized(format!(
            "wrong auth for node {}",
            credentials.node_id
        ))),
        None if auto_register => {
            let node = DoorNode::new(credentials.node_id, credentials.auth.clone());
            if db.register_node(&node, true)? {
                tracing::info!(remote_node_id = credentials.node_id, "registered node");
                Ok(())
            } else if db.adopt_node_auth(credentials.node_id, &credentials.auth)? {
                Ok(())
            } else {
                Err(ServerError::NotAuthorized(format!(
                    "wrong auth for node {}",
                    credentials.node_id
                )))
            }
        }
        None => Err(ServerError::NotAuthorized(format!(
            "unknown node {}",
            credentials.node_id
        ))),
    }
}
