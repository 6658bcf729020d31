//! Node registry and local node identity.

use crate::entities::{DoorNode, OUTGOING_REPLICATION_TABLE};
use crate::error::CoreResult;
use crate::metadata::MetadataRegistry;
use door_storage::{Connection, Value};
use rand::distributions::Alphanumeric;
use rand::Rng;

const AUTH_LENGTH: usize = 32;

/// Inserts a node. Existing nodes are left unchanged.
///
/// With `backfill`, every stored entity of every replicated table is
/// enqueued for the new node. Returns false if the node already existed.
pub fn register_node(
    conn: &dyn Connection,
    registry: &MetadataRegistry,
    node: &DoorNode,
    backfill: bool,
) -> CoreResult<bool> {
    let inserted = conn
        .prepare("INSERT OR IGNORE INTO DoorNode (nodeId, auth, endpoint) VALUES (?, ?, ?)")?
        .execute(&[
            Value::Integer(node.node_id),
            Value::from(node.auth.as_str()),
            Value::from(node.endpoint.clone()),
        ])?;
    if inserted == 0 {
        return Ok(false);
    }
    tracing::info!(node_id = node.node_id, backfill, "registered node");

    if backfill {
        let queued = backfill_node(conn, registry, node.node_id)?;
        tracing::debug!(node_id = node.node_id, count = queued, "backfilled node");
    }
    Ok(true)
}

fn backfill_node(conn: &dyn Connection, registry: &MetadataRegistry, node_id: i64) -> CoreResult<usize> {
    let mut queued = 0;
    for metadata in registry.iter() {
        let keys = conn.prepare(&metadata.select_all_keys_sql())?.query(&[])?;
        let mut insert = conn.prepare(
            "INSERT INTO OutgoingReplication (destNodeId, orTableId, orPk1, orPk2) VALUES (?, ?, ?, ?)",
        )?;
        for row in keys {
            insert.execute(&[
                Value::Integer(node_id),
                Value::from(metadata.table_id),
                Value::Integer(row.get_i64("pk1")?),
                Value::Integer(row.get_i64("pk2")?),
            ])?;
            queued += 1;
        }
    }
    if queued > 0 {
        conn.invalidate(OUTGOING_REPLICATION_TABLE);
    }
    Ok(queued)
}

/// Looks up a node by id.
pub fn find_node(conn: &dyn Connection, node_id: i64) -> CoreResult<Option<DoorNode>> {
    conn.prepare("SELECT nodeId, auth, endpoint FROM DoorNode WHERE nodeId = ?")?
        .query(&[Value::Integer(node_id)])?
        .next()
        .map(|row| DoorNode::from_row(&row))
        .transpose()
}

/// Lists all known nodes ordered by id.
pub fn list_nodes(conn: &dyn Connection) -> CoreResult<Vec<DoorNode>> {
    conn.prepare("SELECT nodeId, auth, endpoint FROM DoorNode ORDER BY nodeId")?
        .query(&[])?
        .map(|row| DoorNode::from_row(&row))
        .collect()
}

/// Returns true if `node_id` is known and `auth` is its secret.
///
/// Nodes stored without a secret (upstream servers a client registered
/// after its handshake) never authenticate until [`adopt_auth`] gives them
/// one.
pub fn authenticate(conn: &dyn Connection, node_id: i64, auth: &str) -> CoreResult<bool> {
    Ok(find_node(conn, node_id)?.is_some_and(|node| !node.auth.is_empty() && node.auth == auth))
}

/// Stores `auth` as the secret of a node registered without one.
///
/// Returns false if the node is unknown or already has a secret.
pub fn adopt_auth(conn: &dyn Connection, node_id: i64, auth: &str) -> CoreResult<bool> {
    if auth.is_empty() {
        return Ok(false);
    }
    let updated = conn
        .prepare("UPDATE DoorNode SET auth = ? WHERE nodeId = ? AND auth = ''")?
        .execute(&[Value::from(auth), Value::Integer(node_id)])?;
    Ok(updated > 0)
}

/// Loads the local node identity, creating and storing it if needed.
///
/// Explicit values override what is stored.
pub fn load_or_create_local_node(
    conn: &dyn Connection,
    node_id: Option<i64>,
    auth: Option<&str>,
) -> CoreResult<(i64, String)> {
    let stored = conn
        .prepare("SELECT nodeClientId, nodeAuth FROM SyncNode LIMIT 1")?
        .query(&[])?
        .next()
        .map(|row| -> CoreResult<(i64, String)> {
            Ok((
                row.get_i64("nodeClientId")?,
                row.get_opt_text("nodeAuth")?.unwrap_or_default(),
            ))
        })
        .transpose()?;

    let (stored_id, stored_auth) =
        stored.map_or((None, None), |(id, auth)| (Some(id), Some(auth)));
    let resolved_id = node_id.or(stored_id).unwrap_or_else(generate_node_id);
    let resolved_auth = auth
        .map(str::to_string)
        .or(stored_auth)
        .unwrap_or_else(generate_auth);

    if stored_id != Some(resolved_id) || auth.is_some() {
        conn.execute_batch("DELETE FROM SyncNode")?;
        conn.prepare("INSERT INTO SyncNode (nodeClientId, nodeAuth) VALUES (?, ?)")?
            .execute(&[Value::Integer(resolved_id), Value::from(resolved_auth.as_str())])?;
        tracing::info!(local_node_id = resolved_id, "stored local node identity");
    }
    Ok((resolved_id, resolved_auth))
}

fn generate_node_id() -> i64 {
    rand::thread_rng().gen_range(1..i64::MAX)
}

fn generate_auth() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTH_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::metadata::{EntityField, FieldType, ReplicationEntityMetaData};
    use crate::schema::install_system_schema;
    use door_storage::{SqliteBackend, StorageBackend, TransactionMode};

    fn setup() -> (SqliteBackend, MetadataRegistry) {
        let metadata = ReplicationEntityMetaData::new(
            1,
            "Item",
            "itemUid",
            "itemVersion",
            vec![
                EntityField::new("itemUid", FieldType::Integer),
                EntityField::new("itemVersion", FieldType::Integer),
            ],
        );
        let backend = SqliteBackend::open_in_memory().unwrap();
        install_system_schema(&backend).unwrap();
        backend.execute_batch(&metadata.install_sql()).unwrap();
        backend
            .execute_batch("INSERT INTO Item VALUES (1, 1), (2, 1), (3, 1)")
            .unwrap();
        (backend, MetadataRegistry::from_entities([metadata]).unwrap())
    }

    fn pending(backend: &SqliteBackend, node_id: i64) -> i64 {
        backend
            .transaction(TransactionMode::ReadOnly, |conn| {
                conn.prepare("SELECT COUNT(*) AS n FROM OutgoingReplication WHERE destNodeId = ?")?
                    .query(&[Value::Integer(node_id)])?
                    .next()
                    .map_or(Ok(0), |row| row.get_i64("n"))
                    .map_err(CoreError::from)
            })
            .unwrap()
    }

    #[test]
    fn register_with_backfill_enqueues_everything() {
        let (backend, registry) = setup();
        let inserted = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                register_node(conn, &registry, &DoorNode::new(9, "nine"), true)
            })
            .unwrap();
        assert!(inserted);
        assert_eq!(pending(&backend, 9), 3);

        let again = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                register_node(conn, &registry, &DoorNode::new(9, "other"), true)
            })
            .unwrap();
        assert!(!again);
        assert_eq!(pending(&backend, 9), 3);
    }

    #[test]
    fn register_without_backfill() {
        let (backend, registry) = setup();
        backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                register_node(conn, &registry, &DoorNode::new(4, "four"), false)
            })
            .unwrap();
        assert_eq!(pending(&backend, 4), 0);
    }

    #[test]
    fn authenticate_checks_secret() {
        let (backend, registry) = setup();
        backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                register_node(conn, &registry, &DoorNode::new(4, "four").with_endpoint("http://x"), false)
            })
            .unwrap();
        let (good, bad, unknown, listed) = backend
            .transaction(TransactionMode::ReadOnly, |conn| {
                Ok::<_, CoreError>((
                    authenticate(conn, 4, "four")?,
                    authenticate(conn, 4, "five")?,
                    authenticate(conn, 5, "four")?,
                    list_nodes(conn)?,
                ))
            })
            .unwrap();
        assert!(good);
        assert!(!bad);
        assert!(!unknown);
        assert_eq!(listed[0].endpoint.as_deref(), Some("http://x"));
    }

    #[test]
    fn secretless_node_adopts_first_secret() {
        let (backend, registry) = setup();
        let (adopted, again, other, known, unknown, good) = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                register_node(conn, &registry, &DoorNode::new(6, ""), false)?;
                register_node(conn, &registry, &DoorNode::new(7, "seven"), false)?;
                Ok::<_, CoreError>((
                    adopt_auth(conn, 6, "six")?,
                    adopt_auth(conn, 6, "six")?,
                    adopt_auth(conn, 6, "intruder")?,
                    adopt_auth(conn, 7, "intruder")?,
                    adopt_auth(conn, 8, "eight")?,
                    authenticate(conn, 6, "six")?,
                ))
            })
            .unwrap();
        assert!(adopted);
        assert!(!again);
        assert!(!other);
        assert!(!known);
        assert!(!unknown);
        assert!(good);
    }

    #[test]
    fn local_identity_is_stable() {
        let (backend, _) = setup();
        let first = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                load_or_create_local_node(conn, None, None)
            })
            .unwrap();
        let second = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                load_or_create_local_node(conn, None, None)
            })
            .unwrap();
        assert_eq!(first, second);
        assert!(first.0 > 0);
        assert_eq!(first.1.len(), AUTH_LENGTH);

        let overridden = backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                load_or_create_local_node(conn, Some(77), None)
            })
            .unwrap();
        assert_eq!(overridden, (77, first.1));
    }
}
