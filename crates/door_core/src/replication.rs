//! Replication data access.
//!
//! Queries over the outgoing queue and the replicated entity tables. Each
//! function runs against a connection inside a transaction the caller owns;
//! [`crate::DoorDatabase`] wraps them with the right transaction modes.

use crate::change_capture::{flush_change_log, record_change_log};
use crate::entities::{ChangeType, OutgoingReplication};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{MetadataRegistry, ReplicationEntityMetaData};
use door_storage::{Connection, Value};
use door_sync_protocol::{DoorMessage, DoorReplicationEntity, ReplicationTracker};

/// Pending rows selected for one destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    /// Entities ready to send, in `orUid` order.
    pub replications: Vec<DoorReplicationEntity>,
    /// Queue ids whose entity no longer exists.
    pub orphans: Vec<i64>,
}

/// Result of applying a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Sender queue ids of every entity in the message. All of them are
    /// safe to acknowledge once the transaction commits.
    pub received: Vec<i64>,
    /// Number of entities that were newer than the local copy and written.
    pub applied: usize,
    /// Queue rows created to forward applied entities to other nodes.
    pub forwarded: usize,
}

/// Selects up to `limit` pending queue rows for `node_id`, ordered by
/// `orUid`, joined with the current state of each entity.
///
/// Rows whose entity is gone are reported as orphans instead.
pub fn select_pending_outgoing_replications(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    node_id: i64,
    limit: usize,
) -> CoreResult<PendingBatch> {
    let rows: Vec<OutgoingReplication> = conn
        .prepare(
            "SELECT orUid, destNodeId, orTableId, orPk1, orPk2 FROM OutgoingReplication \
             WHERE destNodeId = ? ORDER BY orUid LIMIT ?",
        )?
        .query(&[Value::Integer(node_id), Value::Integer(limit_param(limit))])?
        .map(|row| OutgoingReplication::from_row(&row))
        .collect::<CoreResult<_>>()?;

    let mut batch = PendingBatch::default();
    for pending in rows {
        let metadata = registry.get(pending.or_table_id)?;
        match select_entity(conn, metadata, pending.or_pk1, pending.or_pk2)? {
            Some(entity) => batch.replications.push(DoorReplicationEntity {
                table_id: pending.or_table_id,
                or_uid: pending.or_uid,
                entity,
            }),
            None => batch.orphans.push(pending.or_uid),
        }
    }
    Ok(batch)
}

fn select_entity(
    conn: &dyn Connection,
    metadata: &ReplicationEntityMetaData,
    pk1: i64,
    pk2: i64,
) -> CoreResult<Option<serde_json::Value>> {
    conn.prepare(&metadata.select_by_key_sql())?
        .query(&metadata.key_params(pk1, pk2))?
        .next()
        .map(|row| metadata.row_to_json(&row))
        .transpose()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Deletes the queue rows `(orUid, node_id)` the destination acknowledged.
/// Unknown ids are ignored. Returns the number of rows deleted.
pub fn acknowledge_received_replications(
    conn: &dyn Connection,
    node_id: i64,
    received_uids: &[i64],
) -> CoreResult<usize> {
    let mut delete =
        conn.prepare("DELETE FROM OutgoingReplication WHERE orUid = ? AND destNodeId = ?")?;
    let mut deleted = 0;
    for uid in received_uids {
        deleted += delete.execute(&[Value::Integer(*uid), Value::Integer(node_id)])?;
    }
    Ok(deleted)
}

/// Deletes queue rows by id, regardless of destination.
pub fn delete_outgoing_replications(conn: &dyn Connection, or_uids: &[i64]) -> CoreResult<usize> {
    let mut delete = conn.prepare("DELETE FROM OutgoingReplication WHERE orUid = ?")?;
    let mut deleted = 0;
    for uid in or_uids {
        deleted += delete.execute(&[Value::Integer(*uid)])?;
    }
    Ok(deleted)
}

/// Selects the next batch for `node_id`, deleting orphaned queue rows until
/// the batch holds data or the queue is exhausted. Requires a write
/// transaction.
pub(crate) fn select_pending_purging_orphans(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    node_id: i64,
    limit: usize,
) -> CoreResult<Vec<DoorReplicationEntity>> {
    loop {
        let batch = select_pending_outgoing_replications(conn, registry, node_id, limit)?;
        if batch.orphans.is_empty() {
            return Ok(batch.replications);
        }
        let purged = delete_outgoing_replications(conn, &batch.orphans)?;
        tracing::debug!(remote_node_id = node_id, count = purged, "purged orphaned queue rows");
        if !batch.replications.is_empty() {
            return Ok(batch.replications);
        }
    }
}

/// Applies every entity in `message`.
///
/// Table groups are applied in order through each table's insert strategy.
/// An entity is written only if its version is strictly greater than the
/// stored one, so applying the same message twice changes nothing. Applied
/// entities are queued for every other known node except the sender.
pub fn insert_entities_from_message(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    local_node_id: i64,
    message: &DoorMessage,
) -> CoreResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome {
        received: message.or_uids(),
        ..ApplyOutcome::default()
    };

    for (table_id, group) in message.table_groups() {
        let metadata = registry.get(table_id)?;
        let insert_sql = metadata.remote_insert_sql();
        let mut group_applied = 0;
        for replication in group {
            let (pk1, pk2) = metadata.key_of(&replication.entity)?;
            let incoming = metadata.version_of(&replication.entity)?;
            let stored = stored_version(conn, metadata, pk1, pk2)?;
            if stored.is_some_and(|v| incoming <= v) {
                continue;
            }

            let params = metadata.json_to_params(&replication.entity)?;
            conn.prepare(&insert_sql)?.execute(&params)?;
            let change = if stored.is_some() {
                ChangeType::Update
            } else {
                ChangeType::Insert
            };
            record_change_log(conn, table_id, pk1, pk2, change)?;
            group_applied += 1;
        }
        outcome.applied += group_applied;
        if group_applied > 0 {
            conn.invalidate(&metadata.entity_table_name);
        }
    }

    outcome.forwarded = flush_change_log(conn, local_node_id, Some(message.from_node))?;
    tracing::debug!(
        local_node_id,
        remote_node_id = message.from_node,
        count = outcome.received.len(),
        applied = outcome.applied,
        forwarded = outcome.forwarded,
        "applied incoming message"
    );
    Ok(outcome)
}

fn stored_version(
    conn: &dyn Connection,
    metadata: &ReplicationEntityMetaData,
    pk1: i64,
    pk2: i64,
) -> CoreResult<Option<i64>> {
    conn.prepare(&metadata.select_version_sql())?
        .query(&metadata.key_params(pk1, pk2))?
        .next()
        .map(|row| row.get_i64("versionId"))
        .transpose()
        .map_err(CoreError::from)
}

fn single_key_metadata<'r>(
    registry: &'r MetadataRegistry,
    table_id: i32,
) -> CoreResult<&'r ReplicationEntityMetaData> {
    let metadata = registry.get(table_id)?;
    if metadata.has_composite_key() {
        return Err(CoreError::invalid_metadata(
            table_id,
            "replication trackers need a single-column primary key",
        ));
    }
    Ok(metadata)
}

/// Lists `(primaryKey, versionId)` of entities in `table_id` pending for
/// `node_id`, in queue order.
pub fn find_pending_replication_trackers(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    node_id: i64,
    table_id: i32,
) -> CoreResult<Vec<ReplicationTracker>> {
    let metadata = single_key_metadata(registry, table_id)?;
    conn.prepare(&metadata.find_pending_trackers_sql())?
        .query(&[Value::Integer(node_id)])?
        .map(|row| {
            Ok(ReplicationTracker::new(
                row.get_i64("primaryKey")?,
                row.get_i64("versionId")?,
            ))
        })
        .collect()
}

/// Returns the trackers a peer offered that this node already holds: the
/// entity exists here with exactly the offered version.
pub fn check_pending_replication_trackers(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    table_id: i32,
    trackers: &[ReplicationTracker],
) -> CoreResult<Vec<ReplicationTracker>> {
    let metadata = single_key_metadata(registry, table_id)?;
    let mut stmt = conn.prepare(&metadata.find_up_to_date_sql())?;
    let mut up_to_date = Vec::new();
    for tracker in trackers {
        let found = stmt
            .query(&[
                Value::Integer(tracker.primary_key),
                Value::Integer(tracker.version_id),
            ])?
            .next()
            .is_some();
        if found {
            up_to_date.push(*tracker);
        }
    }
    Ok(up_to_date)
}

/// Drops pending rows for `node_id` whose entity still has the tracker's
/// version. Returns the number of rows deleted.
pub fn mark_replicate_trackers_as_processed(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    node_id: i64,
    table_id: i32,
    trackers: &[ReplicationTracker],
) -> CoreResult<usize> {
    let metadata = single_key_metadata(registry, table_id)?;
    let mut stmt = conn.prepare(&metadata.mark_tracker_processed_sql())?;
    let mut deleted = 0;
    for tracker in trackers {
        deleted += stmt.execute(&[
            Value::Integer(tracker.primary_key),
            Value::Integer(tracker.version_id),
            Value::Integer(node_id),
        ])?;
    }
    Ok(deleted)
}

/// Reads queue rows with `orUid` greater than `after`, up to `limit`.
pub fn outgoing_replications_after(
    conn: &dyn Connection,
    after: i64,
    limit: usize,
) -> CoreResult<Vec<OutgoingReplication>> {
    conn.prepare(
        "SELECT orUid, destNodeId, orTableId, orPk1, orPk2 FROM OutgoingReplication \
         WHERE orUid > ? ORDER BY orUid LIMIT ?",
    )?
    .query(&[Value::Integer(after), Value::Integer(limit_param(limit))])?
    .map(|row| OutgoingReplication::from_row(&row))
    .collect()
}

/// Returns the highest pending `orUid`, or 0 when the queue is empty.
///
/// Any row inserted later has a greater id.
pub fn max_outgoing_uid(conn: &dyn Connection) -> CoreResult<i64> {
    let max = conn
        .prepare("SELECT COALESCE(MAX(orUid), 0) AS maxUid FROM OutgoingReplication")?
        .query(&[])?
        .next()
        .map(|row| row.get_i64("maxUid"))
        .transpose()?;
    Ok(max.unwrap_or(0))
}

/// Counts pending rows per destination node.
pub fn pending_counts(conn: &dyn Connection) -> CoreResult<Vec<(i64, i64)>> {
    conn.prepare(
        "SELECT destNodeId, COUNT(*) AS pending FROM OutgoingReplication \
         GROUP BY destNodeId ORDER BY destNodeId",
    )?
    .query(&[])?
    .map(|row| Ok((row.get_i64("destNodeId")?, row.get_i64("pending")?)))
    .collect()
}
