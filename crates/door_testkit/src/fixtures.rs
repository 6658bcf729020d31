//! Test fixtures and database helpers.
//!
//! Provides a replicated `DiscussionPost` entity and [`TestNode`], a
//! database plus its node event manager with the helpers integration tests
//! keep reaching for.

use door_core::{
    ChangeType, CoreResult, DoorDatabase, DoorDatabaseConfig, DoorNode, EntityField, FieldType,
    MetadataRegistry, NodeEventConfig, NodeEventManager, ReplicationEntityMetaData,
};
use door_storage::{SqliteBackend, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::TempDir;

/// Table id of `DiscussionPost`.
pub const DISCUSSION_POST_TABLE: i32 = 543;

/// A replicated forum post, keyed by `postUid` and versioned by
/// `postLastModified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionPost {
    /// Primary key.
    pub post_uid: i64,
    /// Post this one replies to, 0 for a thread start.
    pub post_reply_to_post_uid: i64,
    /// Title.
    pub post_title: Option<String>,
    /// Body.
    pub post_text: Option<String>,
    /// Version field.
    pub post_last_modified: i64,
    /// Author.
    pub poster_member_uid: i64,
}

impl DiscussionPost {
    /// Creates a thread-starting post.
    pub fn new(post_uid: i64, post_last_modified: i64) -> Self {
        Self {
            post_uid,
            post_reply_to_post_uid: 0,
            post_title: Some(format!("post {post_uid}")),
            post_text: None,
            post_last_modified,
            poster_member_uid: 1,
        }
    }

    /// Sets the body.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.post_text = Some(text.into());
        self
    }

    fn params(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.post_uid),
            Value::Integer(self.post_reply_to_post_uid),
            self.post_title.clone().map_or(Value::Null, Value::Text),
            self.post_text.clone().map_or(Value::Null, Value::Text),
            Value::Integer(self.post_last_modified),
            Value::Integer(self.poster_member_uid),
        ]
    }
}

/// Metadata of `DiscussionPost`.
pub fn discussion_post_metadata() -> ReplicationEntityMetaData {
    ReplicationEntityMetaData::new(
        DISCUSSION_POST_TABLE,
        "DiscussionPost",
        "postUid",
        "postLastModified",
        vec![
            EntityField::new("postUid", FieldType::Integer),
            EntityField::new("postReplyToPostUid", FieldType::Integer),
            EntityField::nullable("postTitle", FieldType::Text),
            EntityField::nullable("postText", FieldType::Text),
            EntityField::new("postLastModified", FieldType::Integer),
            EntityField::new("posterMemberUid", FieldType::Integer),
        ],
    )
}

/// Registry containing only `DiscussionPost`.
pub fn test_registry() -> MetadataRegistry {
    MetadataRegistry::from_entities([discussion_post_metadata()]).expect("Invalid test metadata")
}

const INSERT_POST: &str = "REPLACE INTO DiscussionPost \
     (postUid, postReplyToPostUid, postTitle, postText, postLastModified, posterMemberUid) \
     VALUES (?, ?, ?, ?, ?, ?)";

/// A test node: database, event manager and optional temp directory.
///
/// Must be created inside a tokio runtime.
pub struct TestNode {
    /// The database.
    pub db: DoorDatabase<SqliteBackend>,
    /// The node event manager of `db`.
    pub events: Arc<NodeEventManager<SqliteBackend>>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestNode {
    /// Creates an in-memory node.
    pub fn memory(node_id: i64) -> Self {
        let db = DoorDatabase::open_in_memory(test_registry(), node_config(node_id))
            .expect("Failed to open in-memory database");
        Self::with_database(db, None)
    }

    /// Creates a node backed by a file in a temporary directory.
    pub fn file(node_id: i64) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = DoorDatabase::open_path(
            temp_dir.path().join("door.db"),
            test_registry(),
            node_config(node_id),
        )
        .expect("Failed to open file database");
        Self::with_database(db, Some(temp_dir))
    }

    fn with_database(db: DoorDatabase<SqliteBackend>, temp_dir: Option<TempDir>) -> Self {
        let events = NodeEventManager::start(db.clone(), NodeEventConfig::default())
            .expect("Failed to start node event manager");
        Self {
            db,
            events,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the node id.
    pub fn node_id(&self) -> i64 {
        self.db.local_node_id()
    }

    /// Returns this node as seen from a peer.
    pub fn as_remote(&self) -> DoorNode {
        DoorNode::from(&self.db)
    }

    /// Registers `other` as a peer of this node, without backfill.
    pub fn knows(&self, other: &TestNode) {
        self.db
            .register_node(&other.as_remote(), false)
            .expect("Failed to register node");
    }

    /// Writes a post through the change capture path.
    pub fn insert_post(&self, post: &DiscussionPost) {
        self.insert_posts(std::slice::from_ref(post));
    }

    /// Writes posts in one transaction.
    pub fn insert_posts(&self, posts: &[DiscussionPost]) {
        self.db
            .write(|tx| {
                for post in posts {
                    tx.execute(INSERT_POST, &post.params())?;
                    tx.record_change(DISCUSSION_POST_TABLE, post.post_uid, 0, ChangeType::Insert)?;
                }
                Ok(())
            })
            .expect("Failed to insert posts");
    }

    /// Reads a post.
    pub fn find_post(&self, post_uid: i64) -> Option<DiscussionPost> {
        self.try_find_post(post_uid).expect("Failed to read post")
    }

    fn try_find_post(&self, post_uid: i64) -> CoreResult<Option<DiscussionPost>> {
        let metadata = self.db.registry().get(DISCUSSION_POST_TABLE)?;
        let entity = self.db.read(|conn| {
            conn.prepare(&metadata.select_by_key_sql())?
                .query(&metadata.key_params(post_uid, 0))?
                .next()
                .map(|row| metadata.row_to_json(&row))
                .transpose()
        })?;
        Ok(entity.map(serde_json::from_value).transpose()?)
    }

    /// Returns the stored version of a post.
    pub fn post_version(&self, post_uid: i64) -> Option<i64> {
        self.find_post(post_uid).map(|post| post.post_last_modified)
    }

    /// Counts stored posts.
    pub fn post_count(&self) -> i64 {
        self.db
            .read(|conn| {
                Ok(conn
                    .prepare("SELECT COUNT(*) FROM DiscussionPost")?
                    .query(&[])?
                    .next()
                    .and_then(|row| row.get_index(0).and_then(Value::as_i64))
                    .unwrap_or_default())
            })
            .expect("Failed to count posts")
    }

    /// Returns the number of queue rows pending for `node_id`.
    pub fn pending_for(&self, node_id: i64) -> i64 {
        self.db
            .pending_counts()
            .expect("Failed to count pending rows")
            .into_iter()
            .find(|(dest, _)| *dest == node_id)
            .map_or(0, |(_, count)| count)
    }
}

impl std::ops::Deref for TestNode {
    type Target = DoorDatabase<SqliteBackend>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

fn node_config(node_id: i64) -> DoorDatabaseConfig {
    DoorDatabaseConfig::new()
        .with_local_node_id(node_id)
        .with_local_node_auth(format!("secret-{node_id}"))
}
