//! Bookkeeping schema.

use crate::error::CoreResult;
use door_storage::StorageBackend;

/// Tables every replicating database carries.
///
/// `OutgoingReplication.orUid` uses AUTOINCREMENT so ids are never reused
/// after the highest row is acknowledged; the node event watermark depends
/// on that.
pub const SYSTEM_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS DoorNode (
    nodeId INTEGER PRIMARY KEY NOT NULL,
    auth TEXT NOT NULL,
    endpoint TEXT
);

CREATE TABLE IF NOT EXISTS OutgoingReplication (
    orUid INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    destNodeId INTEGER NOT NULL,
    orTableId INTEGER NOT NULL,
    orPk1 INTEGER NOT NULL,
    orPk2 INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS OutgoingReplication_dest
    ON OutgoingReplication (destNodeId, orUid);

CREATE INDEX IF NOT EXISTS OutgoingReplication_entity
    ON OutgoingReplication (orTableId, orPk1, orPk2, destNodeId);

CREATE TABLE IF NOT EXISTS ChangeLog (
    chTableId INTEGER NOT NULL,
    chEntityPk INTEGER NOT NULL,
    chEntityPk2 INTEGER NOT NULL DEFAULT 0,
    chType INTEGER NOT NULL,
    PRIMARY KEY (chTableId, chEntityPk, chEntityPk2)
);

CREATE TABLE IF NOT EXISTS SyncNode (
    nodeClientId INTEGER PRIMARY KEY NOT NULL,
    nodeAuth TEXT NOT NULL
);
";

/// Creates the bookkeeping tables if they do not exist.
pub fn install_system_schema<B: StorageBackend>(backend: &B) -> CoreResult<()> {
    backend.execute_batch(SYSTEM_SCHEMA)?;
    Ok(())
}
