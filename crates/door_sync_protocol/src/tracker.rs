//! Replication trackers.

use serde::{Deserialize, Serialize};

/// A `(primaryKey, versionId)` pair.
///
/// Trackers let two nodes compare which entity versions each holds without
/// sending the entities themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationTracker {
    /// Entity primary key.
    pub primary_key: i64,
    /// Value of the entity's version field.
    pub version_id: i64,
}

impl ReplicationTracker {
    /// Creates a tracker.
    pub fn new(primary_key: i64, version_id: i64) -> Self {
        Self {
            primary_key,
            version_id,
        }
    }
}
