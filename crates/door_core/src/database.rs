//! Database facade.

use crate::change_capture::{flush_change_log, WriteTransaction};
use crate::config::DoorDatabaseConfig;
use crate::entities::{DoorNode, OutgoingReplication};
use crate::error::CoreResult;
use crate::metadata::MetadataRegistry;
use crate::nodes;
use crate::replication::{self, ApplyOutcome};
use crate::schema::install_system_schema;
use door_storage::{Connection, SqliteBackend, StorageBackend, TransactionMode};
use door_sync_protocol::{
    DoorMessage, DoorReplicationEntity, ReplicationReceivedAck, ReplicationTracker,
};
use std::path::Path;
use std::sync::Arc;

/// A replicating database.
///
/// `DoorDatabase` wraps a [`StorageBackend`] together with the metadata of
/// its replicated entities and the local node identity. It provides:
/// - The application write path with change capture ([`Self::write`])
/// - The node registry
/// - The replication data access operations used by clients and servers
///
/// Handles are cheap to clone and share one backend.
///
/// # Example
///
/// ```rust
/// use door_core::{
///     ChangeType, DoorDatabase, DoorDatabaseConfig, DoorNode, EntityField, FieldType,
///     MetadataRegistry, ReplicationEntityMetaData,
/// };
/// use door_storage::Value;
///
/// let registry = MetadataRegistry::from_entities([ReplicationEntityMetaData::new(
///     1,
///     "Note",
///     "noteUid",
///     "noteVersion",
///     vec![
///         EntityField::new("noteUid", FieldType::Integer),
///         EntityField::new("noteVersion", FieldType::Integer),
///     ],
/// )])
/// .unwrap();
/// let db = DoorDatabase::open_in_memory(registry, DoorDatabaseConfig::new().with_local_node_id(1))
///     .unwrap();
/// db.register_node(&DoorNode::new(2, "secret"), false).unwrap();
///
/// db.write(|tx| {
///     tx.execute("INSERT INTO Note (noteUid, noteVersion) VALUES (?, ?)", &[Value::Integer(7), Value::Integer(1)])?;
///     tx.record_change(1, 7, 0, ChangeType::Insert)
/// })
/// .unwrap();
///
/// assert_eq!(db.select_pending_outgoing_replications(2, 10).unwrap().len(), 1);
/// ```
pub struct DoorDatabase<B: StorageBackend = SqliteBackend> {
    backend: Arc<B>,
    registry: Arc<MetadataRegistry>,
    local_node_id: i64,
    local_node_auth: Arc<str>,
}

impl<B: StorageBackend> Clone for DoorDatabase<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            local_node_id: self.local_node_id,
            local_node_auth: Arc::clone(&self.local_node_auth),
        }
    }
}

impl<B: StorageBackend> std::fmt::Debug for DoorDatabase<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorDatabase")
            .field("local_node_id", &self.local_node_id)
            .field("tables", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl DoorDatabase<SqliteBackend> {
    /// Opens (or creates) a SQLite database file.
    pub fn open_path(
        path: impl AsRef<Path>,
        registry: MetadataRegistry,
        config: DoorDatabaseConfig,
    ) -> CoreResult<Self> {
        Self::open(SqliteBackend::open(path)?, registry, config)
    }

    /// Opens a private in-memory SQLite database.
    pub fn open_in_memory(registry: MetadataRegistry, config: DoorDatabaseConfig) -> CoreResult<Self> {
        Self::open(SqliteBackend::open_in_memory()?, registry, config)
    }
}

impl<B: StorageBackend> DoorDatabase<B> {
    /// Opens a database on `backend`.
    ///
    /// Installs the bookkeeping tables, creates entity tables and receive
    /// views when configured, and loads or creates the local node identity.
    ///
    /// # Errors
    ///
    /// Returns an error if schema installation fails.
    pub fn open(backend: B, registry: MetadataRegistry, config: DoorDatabaseConfig) -> CoreResult<Self> {
        install_system_schema(&backend)?;
        if config.create_entity_tables {
            for metadata in registry.iter() {
                backend.execute_batch(&metadata.install_sql())?;
            }
        }

        let (local_node_id, local_node_auth) =
            backend.transaction(TransactionMode::ReadWrite, |conn| {
                nodes::load_or_create_local_node(
                    conn,
                    config.local_node_id,
                    config.local_node_auth.as_deref(),
                )
            })?;
        tracing::info!(local_node_id, tables = registry.len(), "opened database");

        Ok(Self {
            backend: Arc::new(backend),
            registry: Arc::new(registry),
            local_node_id,
            local_node_auth: local_node_auth.into(),
        })
    }

    /// Returns the local node id.
    pub fn local_node_id(&self) -> i64 {
        self.local_node_id
    }

    /// Returns the local node secret.
    pub fn local_node_auth(&self) -> &str {
        &self.local_node_auth
    }

    /// Returns the storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the replicated entity metadata.
    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// Runs `f` in a write transaction with change capture.
    ///
    /// Changes recorded through [`WriteTransaction::record_change`] are
    /// queued for every known remote node before the transaction commits.
    pub fn write<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&WriteTransaction<'_>) -> CoreResult<T>,
    {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            let value = f(&WriteTransaction::new(conn, &self.registry))?;
            flush_change_log(conn, self.local_node_id, None)?;
            Ok(value)
        })
    }

    /// Runs `f` in a read-only transaction.
    pub fn read<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&dyn Connection) -> CoreResult<T>,
    {
        self.backend.transaction(TransactionMode::ReadOnly, f)
    }

    /// Registers a remote node.
    ///
    /// With `backfill`, every stored entity is queued for the node. Returns
    /// false if the node was already known.
    pub fn register_node(&self, node: &DoorNode, backfill: bool) -> CoreResult<bool> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            nodes::register_node(conn, &self.registry, node, backfill)
        })
    }

    /// Looks up a remote node.
    pub fn find_node(&self, node_id: i64) -> CoreResult<Option<DoorNode>> {
        self.read(|conn| nodes::find_node(conn, node_id))
    }

    /// Lists known remote nodes.
    pub fn list_nodes(&self) -> CoreResult<Vec<DoorNode>> {
        self.read(nodes::list_nodes)
    }

    /// Returns true if `node_id` is known and `auth` is its secret.
    pub fn authenticate_node(&self, node_id: i64, auth: &str) -> CoreResult<bool> {
        self.read(|conn| nodes::authenticate(conn, node_id, auth))
    }

    /// Gives a node registered without a secret (by a handshake) the secret
    /// it first presents. Returns true if `auth` is now the node's secret.
    pub fn adopt_node_auth(&self, node_id: i64, auth: &str) -> CoreResult<bool> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            if nodes::adopt_auth(conn, node_id, auth)? {
                tracing::info!(remote_node_id = node_id, "stored secret of handshake node");
                return Ok(true);
            }
            nodes::authenticate(conn, node_id, auth)
        })
    }

    /// Returns up to `limit` pending entities for `node_id` in `orUid` order.
    ///
    /// Queue rows whose entity no longer exists are skipped.
    pub fn select_pending_outgoing_replications(
        &self,
        node_id: i64,
        limit: usize,
    ) -> CoreResult<Vec<DoorReplicationEntity>> {
        self.read(|conn| {
            replication::select_pending_outgoing_replications(conn, &self.registry, node_id, limit)
                .map(|batch| batch.replications)
        })
    }

    /// Deletes the acknowledged queue rows of `node_id`.
    pub fn acknowledge_received_replications(
        &self,
        node_id: i64,
        received_uids: &[i64],
    ) -> CoreResult<usize> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            replication::acknowledge_received_replications(conn, node_id, received_uids)
        })
    }

    /// Acknowledges `ack` and selects the next batch for `node_id` in one
    /// transaction.
    ///
    /// With nothing to acknowledge the selection runs read-only. If a
    /// read-only selection hits orphaned queue rows, it is repeated in a
    /// write transaction that deletes them.
    pub fn acknowledge_and_select_next_batch(
        &self,
        node_id: i64,
        ack: &ReplicationReceivedAck,
        limit: usize,
    ) -> CoreResult<DoorMessage> {
        let replications = if ack.is_empty() {
            let batch = self.read(|conn| {
                replication::select_pending_outgoing_replications(conn, &self.registry, node_id, limit)
            })?;
            if batch.orphans.is_empty() {
                batch.replications
            } else {
                self.select_purging_orphans(node_id, None, limit)?
            }
        } else {
            self.select_purging_orphans(node_id, Some(&ack.replication_uids), limit)?
        };
        Ok(DoorMessage::replication(
            self.local_node_id,
            node_id,
            replications,
        ))
    }

    fn select_purging_orphans(
        &self,
        node_id: i64,
        ack: Option<&[i64]>,
        limit: usize,
    ) -> CoreResult<Vec<DoorReplicationEntity>> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            if let Some(uids) = ack {
                let deleted = replication::acknowledge_received_replications(conn, node_id, uids)?;
                tracing::trace!(remote_node_id = node_id, count = deleted, "acknowledged");
            }
            replication::select_pending_purging_orphans(conn, &self.registry, node_id, limit)
        })
    }

    /// Applies a received message in one write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::UnknownTable`] or [`crate::CoreError::InvalidEntity`] if
    /// the message does not match local metadata; nothing is applied then.
    pub fn insert_entities_from_message(&self, message: &DoorMessage) -> CoreResult<ApplyOutcome> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            replication::insert_entities_from_message(conn, &self.registry, self.local_node_id, message)
        })
    }

    /// Lists `(primaryKey, versionId)` of entities in `table_id` pending for
    /// `node_id`.
    pub fn find_pending_replication_trackers(
        &self,
        node_id: i64,
        table_id: i32,
    ) -> CoreResult<Vec<ReplicationTracker>> {
        self.read(|conn| {
            replication::find_pending_replication_trackers(conn, &self.registry, node_id, table_id)
        })
    }

    /// Returns the offered trackers this node already holds at exactly the
    /// offered version.
    pub fn check_pending_replication_trackers(
        &self,
        table_id: i32,
        trackers: &[ReplicationTracker],
    ) -> CoreResult<Vec<ReplicationTracker>> {
        self.read(|conn| {
            replication::check_pending_replication_trackers(conn, &self.registry, table_id, trackers)
        })
    }

    /// Drops pending rows for `node_id` that the trackers show the node
    /// already has.
    pub fn mark_replicate_trackers_as_processed(
        &self,
        node_id: i64,
        table_id: i32,
        trackers: &[ReplicationTracker],
    ) -> CoreResult<usize> {
        self.backend.transaction(TransactionMode::ReadWrite, |conn| {
            replication::mark_replicate_trackers_as_processed(
                conn,
                &self.registry,
                node_id,
                table_id,
                trackers,
            )
        })
    }

    /// Reads queue rows with `orUid` greater than `after`.
    pub fn outgoing_replications_after(
        &self,
        after: i64,
        limit: usize,
    ) -> CoreResult<Vec<OutgoingReplication>> {
        self.read(|conn| replication::outgoing_replications_after(conn, after, limit))
    }

    /// Returns the highest pending `orUid`, or 0.
    pub fn max_outgoing_uid(&self) -> CoreResult<i64> {
        self.read(replication::max_outgoing_uid)
    }

    /// Counts pending rows per destination node.
    pub fn pending_counts(&self) -> CoreResult<Vec<(i64, i64)>> {
        self.read(replication::pending_counts)
    }
}

impl From<&DoorDatabase> for DoorNode {
    fn from(db: &DoorDatabase) -> Self {
        DoorNode::new(db.local_node_id, db.local_node_auth.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ChangeType;
    use crate::error::CoreError;
    use crate::metadata::{EntityField, FieldType, ReplicationEntityMetaData};
    use door_storage::Value;
    use proptest::prelude::*;
    use serde_json::json;

    const TABLE: i32 = 543;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::from_entities([ReplicationEntityMetaData::new(
            TABLE,
            "DiscussionPost",
            "postUid",
            "postLastModified",
            vec![
                EntityField::new("postUid", FieldType::Integer),
                EntityField::nullable("postTitle", FieldType::Text),
                EntityField::new("postLastModified", FieldType::Integer),
            ],
        )])
        .unwrap()
    }

    fn open(node_id: i64) -> DoorDatabase {
        DoorDatabase::open_in_memory(
            registry(),
            DoorDatabaseConfig::new()
                .with_local_node_id(node_id)
                .with_local_node_auth(format!("auth{node_id}")),
        )
        .unwrap()
    }

    fn upsert_post(db: &DoorDatabase, uid: i64, title: &str, version: i64) {
        db.write(|tx| {
            tx.execute(
                "REPLACE INTO DiscussionPost (postUid, postTitle, postLastModified) VALUES (?, ?, ?)",
                &[Value::Integer(uid), Value::from(title), Value::Integer(version)],
            )?;
            tx.record_change(TABLE, uid, 0, ChangeType::Update)
        })
        .unwrap();
    }

    fn post(db: &DoorDatabase, uid: i64) -> Option<(String, i64)> {
        db.read(|conn| {
            conn.prepare("SELECT postTitle, postLastModified FROM DiscussionPost WHERE postUid = ?")?
                .query(&[Value::Integer(uid)])?
                .next()
                .map(|row| {
                    Ok((
                        row.get_opt_text("postTitle")?.unwrap_or_default(),
                        row.get_i64("postLastModified")?,
                    ))
                })
                .transpose()
        })
        .unwrap()
    }

    fn message(from: i64, to: i64, entities: &[(i64, i64, &str, i64)]) -> DoorMessage {
        DoorMessage::replication(
            from,
            to,
            entities
                .iter()
                .map(|(or_uid, uid, title, version)| DoorReplicationEntity {
                    table_id: TABLE,
                    or_uid: *or_uid,
                    entity: json!({ "postUid": uid, "postTitle": title, "postLastModified": version }),
                })
                .collect(),
        )
    }

    #[test]
    fn write_enqueues_for_registered_nodes() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "auth2"), false).unwrap();
        upsert_post(&db, 7, "hello", 1);

        let pending = db.select_pending_outgoing_replications(2, 1000).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table_id, TABLE);
        assert_eq!(pending[0].entity["postUid"], 7);
        assert!(db.select_pending_outgoing_replications(1, 1000).unwrap().is_empty());
    }

    #[test]
    fn failed_write_enqueues_nothing() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "auth2"), false).unwrap();
        let result: CoreResult<()> = db.write(|tx| {
            tx.record_change(TABLE, 1, 0, ChangeType::Insert)?;
            Err(CoreError::Closed)
        });
        assert!(result.is_err());
        assert!(db.pending_counts().unwrap().is_empty());
    }

    #[test]
    fn ack_and_select_pages_in_order() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "auth2"), false).unwrap();
        for uid in 1..=5 {
            upsert_post(&db, uid, "p", 1);
        }

        let first = db
            .acknowledge_and_select_next_batch(2, &ReplicationReceivedAck::default(), 2)
            .unwrap();
        assert_eq!(first.from_node, 1);
        assert_eq!(first.to_node, 2);
        assert_eq!(first.len(), 2);

        let second = db
            .acknowledge_and_select_next_batch(2, &ReplicationReceivedAck::new(first.or_uids()), 2)
            .unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.or_uids()[0] > first.or_uids()[1]);

        let third = db
            .acknowledge_and_select_next_batch(2, &ReplicationReceivedAck::new(second.or_uids()), 2)
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(db.pending_counts().unwrap(), vec![(2, 1)]);
    }

    #[test]
    fn ack_only_deletes_for_that_node() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "a"), false).unwrap();
        db.register_node(&DoorNode::new(3, "b"), false).unwrap();
        upsert_post(&db, 1, "p", 1);

        let for_two = db.select_pending_outgoing_replications(2, 10).unwrap();
        let for_three = db.select_pending_outgoing_replications(3, 10).unwrap();
        assert_eq!(db.acknowledge_received_replications(2, &[for_three[0].or_uid]).unwrap(), 0);
        assert_eq!(db.acknowledge_received_replications(2, &[for_two[0].or_uid]).unwrap(), 1);
        assert_eq!(db.pending_counts().unwrap(), vec![(3, 1)]);
    }

    #[test]
    fn orphans_are_purged_and_do_not_block() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "a"), false).unwrap();
        upsert_post(&db, 1, "gone", 1);
        upsert_post(&db, 2, "kept", 1);
        db.write(|tx| {
            tx.execute("DELETE FROM DiscussionPost WHERE postUid = 1", &[])?;
            Ok(())
        })
        .unwrap();

        let batch = db
            .acknowledge_and_select_next_batch(2, &ReplicationReceivedAck::default(), 1)
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.replications[0].entity["postUid"], 2);
        assert_eq!(db.pending_counts().unwrap(), vec![(2, 1)]);
    }

    #[test]
    fn incoming_message_applies_newer_versions_only() {
        let db = open(2);
        upsert_post(&db, 5, "local", 10);

        let outcome = db
            .insert_entities_from_message(&message(1, 2, &[(100, 5, "stale", 9), (101, 6, "new", 1)]))
            .unwrap();
        assert_eq!(outcome.received, vec![100, 101]);
        assert_eq!(outcome.applied, 1);
        assert_eq!(post(&db, 5), Some(("local".into(), 10)));
        assert_eq!(post(&db, 6), Some(("new".into(), 1)));
    }

    #[test]
    fn redelivery_is_a_no_op() {
        let db = open(2);
        let msg = message(1, 2, &[(1, 7, "v1", 1)]);
        assert_eq!(db.insert_entities_from_message(&msg).unwrap().applied, 1);
        assert_eq!(db.insert_entities_from_message(&msg).unwrap().applied, 0);
        assert_eq!(post(&db, 7), Some(("v1".into(), 1)));
    }

    #[test]
    fn applied_entities_are_forwarded_except_to_sender() {
        let hub = open(100);
        hub.register_node(&DoorNode::new(1, "a"), false).unwrap();
        hub.register_node(&DoorNode::new(2, "b"), false).unwrap();

        let outcome = hub
            .insert_entities_from_message(&message(1, 100, &[(1, 7, "from one", 1)]))
            .unwrap();
        assert_eq!(outcome.forwarded, 1);
        assert_eq!(hub.pending_counts().unwrap(), vec![(2, 1)]);
    }

    #[test]
    fn unknown_table_aborts_whole_message() {
        let db = open(2);
        let mut msg = message(1, 2, &[(1, 7, "ok", 1)]);
        msg.replications.push(DoorReplicationEntity {
            table_id: 999,
            or_uid: 2,
            entity: json!({}),
        });
        let err = db.insert_entities_from_message(&msg).unwrap_err();
        assert!(err.is_data_error());
        assert_eq!(post(&db, 7), None);
    }

    #[test]
    fn check_trackers_returns_entities_already_current() {
        let db = open(1);
        upsert_post(&db, 1, "a", 100);
        upsert_post(&db, 2, "b", 200);

        let current = db
            .check_pending_replication_trackers(
                TABLE,
                &[ReplicationTracker::new(1, 100), ReplicationTracker::new(2, 50)],
            )
            .unwrap();
        assert_eq!(current, vec![ReplicationTracker::new(1, 100)]);
    }

    #[test]
    fn find_and_mark_trackers() {
        let db = open(1);
        db.register_node(&DoorNode::new(2, "a"), false).unwrap();
        upsert_post(&db, 1, "a", 100);
        upsert_post(&db, 2, "b", 200);

        let pending = db.find_pending_replication_trackers(2, TABLE).unwrap();
        assert_eq!(
            pending,
            vec![ReplicationTracker::new(1, 100), ReplicationTracker::new(2, 200)]
        );

        let marked = db
            .mark_replicate_trackers_as_processed(
                2,
                TABLE,
                &[ReplicationTracker::new(1, 100), ReplicationTracker::new(2, 199)],
            )
            .unwrap();
        assert_eq!(marked, 1);
        assert_eq!(
            db.find_pending_replication_trackers(2, TABLE).unwrap(),
            vec![ReplicationTracker::new(2, 200)]
        );
    }

    #[test]
    fn register_node_backfills_existing_entities() {
        let db = open(1);
        upsert_post(&db, 1, "a", 1);
        upsert_post(&db, 2, "b", 1);
        assert!(db.register_node(&DoorNode::new(5, "x"), true).unwrap());
        assert_eq!(db.pending_counts().unwrap(), vec![(5, 2)]);
    }

    #[test]
    fn local_identity_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("door.db");
        let first = DoorDatabase::open_path(&path, registry(), DoorDatabaseConfig::new()).unwrap();
        let id = first.local_node_id();
        let auth = first.local_node_auth().to_string();
        drop(first);

        let second = DoorDatabase::open_path(&path, registry(), DoorDatabaseConfig::new()).unwrap();
        assert_eq!(second.local_node_id(), id);
        assert_eq!(second.local_node_auth(), auth);
        assert_eq!(DoorNode::from(&second).node_id, id);
    }

    proptest! {
        #[test]
        fn last_writer_wins_regardless_of_delivery_order(
            versions in proptest::collection::vec(1i64..20, 1..12),
            seed in any::<u64>(),
        ) {
            let db = open(2);
            let entities: Vec<(i64, i64, String, i64)> = versions
                .iter()
                .enumerate()
                .map(|(i, v)| (i as i64 + 1, 7, format!("v{v}"), *v))
                .collect();

            let mut order: Vec<usize> = (0..entities.len()).collect();
            let mut state = seed;
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state >> 33) as usize % (i + 1));
            }

            for index in order {
                let (or_uid, uid, title, version) = &entities[index];
                db.insert_entities_from_message(&message(1, 2, &[(*or_uid, *uid, title.as_str(), *version)]))
                    .unwrap();
            }

            let max = *versions.iter().max().unwrap();
            let (_, stored_version) = post(&db, 7).unwrap();
            prop_assert_eq!(stored_version, max);
        }

        #[test]
        fn delivered_uids_strictly_increase(updates in proptest::collection::vec(1i64..6, 1..30)) {
            let db = open(1);
            db.register_node(&DoorNode::new(2, "a"), false).unwrap();
            for (version, uid) in updates.iter().enumerate() {
                upsert_post(&db, *uid, "p", version as i64 + 1);
            }

            let mut delivered = Vec::new();
            let mut ack = ReplicationReceivedAck::default();
            loop {
                let batch = db.acknowledge_and_select_next_batch(2, &ack, 2).unwrap();
                if batch.is_empty() {
                    break;
                }
                delivered.extend(batch.or_uids());
                ack = ReplicationReceivedAck::new(batch.or_uids());
            }
            prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
