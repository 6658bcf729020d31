//! In-process node events.

use crate::messages::MessageKind;
use serde::{Deserialize, Serialize};

/// Signals that an entity is pending delivery to a node.
///
/// Node events never leave the process. One event is emitted per new
/// outgoing queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    /// Event kind.
    pub what: MessageKind,
    /// Destination node.
    pub to_node: i64,
    /// Table id of the entity.
    pub table_id: i32,
    /// First primary key component.
    pub key1: i64,
    /// Second primary key component (0 when unused).
    pub key2: i64,
}

impl NodeEvent {
    /// Returns true if this is a replication event addressed to `node_id`.
    pub fn is_replication_for(&self, node_id: i64) -> bool {
        self.what == MessageKind::Replication && self.to_node == node_id
    }
}
