//! Change capture on the application write path.
//!
//! Instead of database triggers, mutating code records each change it makes
//! through [`WriteTransaction::record_change`]. Changes collect in the
//! `ChangeLog` table (one row per entity) and are fanned out to
//! `OutgoingReplication`, one row per remote node, before the transaction
//! commits. The entity write and its delivery obligations therefore commit
//! or roll back together.

use crate::entities::{ChangeLog, ChangeType, CHANGE_LOG_TABLE, OUTGOING_REPLICATION_TABLE};
use crate::error::CoreResult;
use crate::metadata::MetadataRegistry;
use door_storage::{Connection, ResultSet, Value};

/// A write transaction with change recording.
///
/// Obtained from [`crate::DoorDatabase::write`].
pub struct WriteTransaction<'a> {
    conn: &'a dyn Connection,
    registry: &'a MetadataRegistry,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(conn: &'a dyn Connection, registry: &'a MetadataRegistry) -> Self {
        Self { conn, registry }
    }

    /// Executes a statement and returns the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> CoreResult<usize> {
        Ok(self.conn.prepare(sql)?.execute(params)?)
    }

    /// Runs a query.
    pub fn query(&self, sql: &str, params: &[Value]) -> CoreResult<ResultSet> {
        Ok(self.conn.prepare(sql)?.query(params)?)
    }

    /// Records that an entity changed.
    ///
    /// `pk2` is 0 for entities with a single-column key. Inserts and
    /// updates queue the entity for every remote node. Deletes are not
    /// replicated: a [`ChangeType::Delete`] drops the entity's pending rows
    /// instead, since there is nothing left to send.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::UnknownTable`] if `table_id` is not a
    /// replicated table.
    pub fn record_change(
        &self,
        table_id: i32,
        pk1: i64,
        pk2: i64,
        change_type: ChangeType,
    ) -> CoreResult<()> {
        let metadata = self.registry.get(table_id)?;
        record_change_log(self.conn, table_id, pk1, pk2, change_type)?;
        self.conn.invalidate(&metadata.entity_table_name);
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &dyn Connection {
        self.conn
    }
}

/// Upserts the `ChangeLog` row of an entity.
pub(crate) fn record_change_log(
    conn: &dyn Connection,
    table_id: i32,
    pk1: i64,
    pk2: i64,
    change_type: ChangeType,
) -> CoreResult<()> {
    conn.prepare(
        "INSERT INTO ChangeLog (chTableId, chEntityPk, chEntityPk2, chType) VALUES (?, ?, ?, ?) \
         ON CONFLICT (chTableId, chEntityPk, chEntityPk2) DO UPDATE SET chType = excluded.chType",
    )?
    .execute(&[
        Value::from(table_id),
        Value::Integer(pk1),
        Value::Integer(pk2),
        Value::Integer(change_type.code()),
    ])?;
    conn.invalidate(CHANGE_LOG_TABLE);
    Ok(())
}

/// Fans out every `ChangeLog` row to `OutgoingReplication` and clears the
/// change log. Returns the number of queue rows created.
///
/// Nodes equal to `local_node_id` or `exclude_node_id` receive nothing.
pub(crate) fn flush_change_log(
    conn: &dyn Connection,
    local_node_id: i64,
    exclude_node_id: Option<i64>,
) -> CoreResult<usize> {
    let changes: Vec<ChangeLog> = conn
        .prepare("SELECT chTableId, chEntityPk, chEntityPk2, chType FROM ChangeLog")?
        .query(&[])?
        .map(|row| ChangeLog::from_row(&row))
        .collect::<CoreResult<_>>()?;
    if changes.is_empty() {
        return Ok(0);
    }

    let mut queued = 0;
    for change in &changes {
        if change.ch_type == ChangeType::Delete {
            drop_pending(conn, change.ch_table_id, change.ch_entity_pk, change.ch_entity_pk2)?;
            continue;
        }
        queued += enqueue_for_nodes(
            conn,
            change.ch_table_id,
            change.ch_entity_pk,
            change.ch_entity_pk2,
            local_node_id,
            exclude_node_id.unwrap_or(local_node_id),
        )?;
    }
    conn.execute_batch("DELETE FROM ChangeLog")?;
    tracing::trace!(changes = changes.len(), count = queued, "fanned out change log");
    Ok(queued)
}

/// Replaces the pending rows of one entity with a fresh row per remote node.
///
/// A row still waiting for acknowledgment is deleted and re-inserted, so it
/// gets a new `orUid` and is sent again after the in-flight copy.
fn enqueue_for_nodes(
    conn: &dyn Connection,
    table_id: i32,
    pk1: i64,
    pk2: i64,
    local_node_id: i64,
    exclude_node_id: i64,
) -> CoreResult<usize> {
    let params = [
        Value::from(table_id),
        Value::Integer(pk1),
        Value::Integer(pk2),
        Value::Integer(local_node_id),
        Value::Integer(exclude_node_id),
    ];
    conn.prepare(
        "DELETE FROM OutgoingReplication \
         WHERE orTableId = ?1 AND orPk1 = ?2 AND orPk2 = ?3 \
         AND destNodeId IN (SELECT nodeId FROM DoorNode WHERE nodeId != ?4 AND nodeId != ?5)",
    )?
    .execute(&params)?;
    let inserted = conn
        .prepare(
            "INSERT INTO OutgoingReplication (destNodeId, orTableId, orPk1, orPk2) \
             SELECT nodeId, ?1, ?2, ?3 FROM DoorNode \
             WHERE nodeId != ?4 AND nodeId != ?5 ORDER BY nodeId",
        )?
        .execute(&params)?;
    if inserted > 0 {
        conn.invalidate(OUTGOING_REPLICATION_TABLE);
    }
    Ok(inserted)
}

/// Removes every pending row of one entity.
fn drop_pending(conn: &dyn Connection, table_id: i32, pk1: i64, pk2: i64) -> CoreResult<usize> {
    let deleted = conn
        .prepare(
            "DELETE FROM OutgoingReplication WHERE orTableId = ? AND orPk1 = ? AND orPk2 = ?",
        )?
        .execute(&[Value::from(table_id), Value::Integer(pk1), Value::Integer(pk2)])?;
    if deleted > 0 {
        conn.invalidate(OUTGOING_REPLICATION_TABLE);
    }
    Ok(deleted)
}
