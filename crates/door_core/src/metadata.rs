//! Replicated entity metadata.
//!
//! Each replicated entity type is described by a [`ReplicationEntityMetaData`]
//! keyed by a stable integer table id. The metadata knows the entity's
//! columns, which of them form the primary key and which one holds the
//! version used for last-writer-wins. From that it produces the SQL the core
//! needs: select-by-key, the receive view with its conflict-resolving
//! trigger, and the upsert used when no receive view is wanted.
//!
//! Metadata is loaded once at startup, typically from a JSON schema file:
//!
//! ```
//! use door_core::MetadataRegistry;
//!
//! let registry = MetadataRegistry::from_json(r#"[{
//!     "tableId": 543,
//!     "entityTableName": "DiscussionPost",
//!     "primaryKeyFields": ["postUid"],
//!     "versionField": "postLastModified",
//!     "fields": [
//!         { "name": "postUid", "type": "integer" },
//!         { "name": "postTitle", "type": "text", "nullable": true },
//!         { "name": "postLastModified", "type": "integer" }
//!     ]
//! }]"#).unwrap();
//!
//! assert_eq!(registry.get(543).unwrap().entity_table_name, "DiscussionPost");
//! assert!(registry.get(1).is_err());
//! ```

use crate::error::{CoreError, CoreResult};
use door_storage::{Row, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::BTreeMap;

/// Column type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Real,
    /// Text.
    Text,
    /// Boolean stored as 0/1.
    Boolean,
}

impl FieldType {
    fn sql_type(self) -> &'static str {
        match self {
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Text => "TEXT",
        }
    }
}

/// One column of a replicated entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityField {
    /// Column name, also the JSON key on the wire.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
}

impl EntityField {
    /// Creates a non-nullable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// Creates a nullable field.
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, field_type)
        }
    }
}

/// How entities received from a peer are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteInsertStrategy {
    /// Insert into the receive view; its trigger keeps the newer version.
    #[default]
    ReceiveView,
    /// Upsert into the entity table, updating only when the incoming
    /// version is newer.
    Upsert,
}

/// Static description of one replicated entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationEntityMetaData {
    /// Stable table id shared by all nodes.
    pub table_id: i32,
    /// Name of the entity table.
    pub entity_table_name: String,
    /// Receive view name. Defaults to `<table>_ReceiveView`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_view_name: Option<String>,
    /// One or two integer primary key columns.
    pub primary_key_fields: Vec<String>,
    /// Integer column compared for last-writer-wins.
    pub version_field: String,
    /// All columns, in insert order.
    pub fields: Vec<EntityField>,
    /// How received entities are written.
    #[serde(default)]
    pub remote_insert_strategy: RemoteInsertStrategy,
}

impl ReplicationEntityMetaData {
    /// Creates metadata for an entity with a single-column primary key.
    pub fn new(
        table_id: i32,
        entity_table_name: impl Into<String>,
        primary_key_field: impl Into<String>,
        version_field: impl Into<String>,
        fields: Vec<EntityField>,
    ) -> Self {
        Self {
            table_id,
            entity_table_name: entity_table_name.into(),
            receive_view_name: None,
            primary_key_fields: vec![primary_key_field.into()],
            version_field: version_field.into(),
            fields,
            remote_insert_strategy: RemoteInsertStrategy::default(),
        }
    }

    /// Adds a second primary key column.
    #[must_use]
    pub fn with_second_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key_fields.truncate(1);
        self.primary_key_fields.push(field.into());
        self
    }

    /// Overrides the receive view name.
    #[must_use]
    pub fn with_receive_view_name(mut self, name: impl Into<String>) -> Self {
        self.receive_view_name = Some(name.into());
        self
    }

    /// Sets the remote insert strategy.
    #[must_use]
    pub fn with_remote_insert_strategy(mut self, strategy: RemoteInsertStrategy) -> Self {
        self.remote_insert_strategy = strategy;
        self
    }

    /// Checks that keys and version refer to integer fields and that every
    /// name is a plain SQL identifier.
    pub fn validate(&self) -> CoreResult<()> {
        let fail = |message: String| Err(CoreError::invalid_metadata(self.table_id, message));

        let mut names = vec![self.entity_table_name.as_str()];
        names.extend(self.receive_view_name.as_deref());
        names.extend(self.fields.iter().map(|f| f.name.as_str()));
        if let Some(bad) = names.iter().find(|n| !is_identifier(n)) {
            return fail(format!("{bad:?} is not a valid identifier"));
        }

        if self.fields.is_empty() {
            return fail("no fields".to_string());
        }
        if !(1..=2).contains(&self.primary_key_fields.len()) {
            return fail("primary key must have one or two fields".to_string());
        }
        for key in self.primary_key_fields.iter().chain([&self.version_field]) {
            match self.field(key) {
                Some(f) if f.field_type == FieldType::Integer && !f.nullable => {}
                Some(_) => return fail(format!("{key} must be a non-null integer field")),
                None => return fail(format!("{key} is not a field")),
            }
        }
        Ok(())
    }

    /// Returns the receive view name.
    pub fn receive_view_name(&self) -> String {
        self.receive_view_name
            .clone()
            .unwrap_or_else(|| format!("{}_ReceiveView", self.entity_table_name))
    }

    /// Returns the field with the given name.
    pub fn field(&self, name: &str) -> Option<&EntityField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns true if the primary key has two columns.
    pub fn has_composite_key(&self) -> bool {
        self.primary_key_fields.len() > 1
    }

    fn pk1(&self) -> &str {
        self.primary_key_fields.first().map_or("", String::as_str)
    }

    fn pk2(&self) -> Option<&str> {
        self.primary_key_fields.get(1).map(String::as_str)
    }

    fn column_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn placeholders(&self) -> String {
        vec!["?"; self.fields.len()].join(", ")
    }

    /// `WHERE` clause matching the primary key against `<prefix>pk`, or
    /// against positional parameters when `prefix` is `None`.
    fn key_match(&self, table: &str, prefix: Option<&str>) -> String {
        let rhs = |field: &str| match prefix {
            Some(p) => format!("{p}{field}"),
            None => "?".to_string(),
        };
        let mut clause = format!("{table}.{pk} = {}", rhs(self.pk1()), pk = self.pk1());
        if let Some(pk2) = self.pk2() {
            clause.push_str(&format!(" AND {table}.{pk2} = {}", rhs(pk2)));
        }
        clause
    }

    /// SQL creating the entity table.
    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let null = if f.nullable { "" } else { " NOT NULL" };
                format!("    {} {}{}", f.name, f.field_type.sql_type(), null)
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n{columns},\n    PRIMARY KEY ({keys})\n)",
            table = self.entity_table_name,
            columns = columns.join(",\n"),
            keys = self.primary_key_fields.join(", "),
        )
    }

    /// SQL creating the receive view and its `INSTEAD OF INSERT` trigger.
    ///
    /// The trigger replaces the stored row only when the incoming version is
    /// strictly greater, or when no row exists yet.
    pub fn receive_view_sql(&self) -> String {
        let table = &self.entity_table_name;
        let view = self.receive_view_name();
        let new_columns = self
            .fields
            .iter()
            .map(|f| format!("NEW.{}", f.name))
            .collect::<Vec<_>>()
            .join(", ");
        let key_match = self.key_match(table, Some("NEW."));
        format!(
            "CREATE VIEW IF NOT EXISTS {view} AS SELECT {columns} FROM {table};\n\
             CREATE TRIGGER IF NOT EXISTS {view}_ins INSTEAD OF INSERT ON {view}\n\
             FOR EACH ROW BEGIN\n\
             REPLACE INTO {table} ({columns}) SELECT {new_columns}\n\
             WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {key_match})\n\
             OR NEW.{version} > (SELECT {version} FROM {table} WHERE {key_match});\n\
             END;",
            columns = self.column_list(),
            version = self.version_field,
        )
    }

    /// All SQL needed to store and receive this entity.
    pub fn install_sql(&self) -> String {
        format!("{};\n{}", self.create_table_sql(), self.receive_view_sql())
    }

    /// Selects every field of one entity by primary key.
    pub fn select_by_key_sql(&self) -> String {
        format!(
            "SELECT {columns} FROM {table} WHERE {key}",
            columns = self.column_list(),
            table = self.entity_table_name,
            key = self.key_match(&self.entity_table_name, None),
        )
    }

    /// Selects the stored version of one entity by primary key.
    pub fn select_version_sql(&self) -> String {
        format!(
            "SELECT {version} AS versionId FROM {table} WHERE {key}",
            version = self.version_field,
            table = self.entity_table_name,
            key = self.key_match(&self.entity_table_name, None),
        )
    }

    /// Selects all primary keys, used to enqueue every entity for a new node.
    pub fn select_all_keys_sql(&self) -> String {
        format!(
            "SELECT {pk1} AS pk1, {pk2} AS pk2 FROM {table} ORDER BY {keys}",
            pk1 = self.pk1(),
            pk2 = self.pk2().unwrap_or("0"),
            table = self.entity_table_name,
            keys = self.primary_key_fields.join(", "),
        )
    }

    /// Selects `(primaryKey, versionId)` of entities pending for a node
    /// (parameter 1) in queue order.
    pub fn find_pending_trackers_sql(&self) -> String {
        format!(
            "SELECT {table}.{pk} AS primaryKey, {table}.{version} AS versionId \
             FROM OutgoingReplication JOIN {table} ON {table}.{pk} = OutgoingReplication.orPk1 \
             WHERE OutgoingReplication.destNodeId = ? AND OutgoingReplication.orTableId = {table_id} \
             ORDER BY OutgoingReplication.orUid",
            table = self.entity_table_name,
            pk = self.pk1(),
            version = self.version_field,
            table_id = self.table_id,
        )
    }

    /// Selects the tracker if the stored entity has exactly the given
    /// primary key (parameter 1) and version (parameter 2).
    pub fn find_up_to_date_sql(&self) -> String {
        format!(
            "SELECT {pk} AS primaryKey, {version} AS versionId FROM {table} \
             WHERE {pk} = ? AND {version} = ?",
            table = self.entity_table_name,
            pk = self.pk1(),
            version = self.version_field,
        )
    }

    /// Deletes the pending row for a node (parameter 3) when the stored
    /// entity still has the given key (parameter 1) and version (parameter 2).
    pub fn mark_tracker_processed_sql(&self) -> String {
        format!(
            "DELETE FROM OutgoingReplication \
             WHERE orTableId = {table_id} AND orPk1 = ?1 AND destNodeId = ?3 \
             AND EXISTS (SELECT 1 FROM {table} WHERE {pk} = ?1 AND {version} = ?2)",
            table_id = self.table_id,
            table = self.entity_table_name,
            pk = self.pk1(),
            version = self.version_field,
        )
    }

    /// SQL writing one received entity, according to the insert strategy.
    /// Parameters are the fields in declaration order.
    pub fn remote_insert_sql(&self) -> String {
        match self.remote_insert_strategy {
            RemoteInsertStrategy::ReceiveView => format!(
                "INSERT INTO {view} ({columns}) VALUES ({values})",
                view = self.receive_view_name(),
                columns = self.column_list(),
                values = self.placeholders(),
            ),
            RemoteInsertStrategy::Upsert => {
                let updates = self
                    .fields
                    .iter()
                    .filter(|f| !self.primary_key_fields.contains(&f.name))
                    .map(|f| format!("{0} = excluded.{0}", f.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {table} ({columns}) VALUES ({values}) \
                     ON CONFLICT ({keys}) DO UPDATE SET {updates} \
                     WHERE excluded.{version} > {table}.{version}",
                    table = self.entity_table_name,
                    columns = self.column_list(),
                    values = self.placeholders(),
                    keys = self.primary_key_fields.join(", "),
                    version = self.version_field,
                )
            }
        }
    }

    /// Converts a row selected by [`Self::select_by_key_sql`] to a JSON
    /// object keyed by field name.
    pub fn row_to_json(&self, row: &Row) -> CoreResult<JsonValue> {
        let mut object = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match (row.get(&field.name)?, field.field_type) {
                (Value::Null, _) => JsonValue::Null,
                (Value::Integer(v), FieldType::Boolean) => JsonValue::Bool(*v != 0),
                (Value::Integer(v), _) => JsonValue::from(*v),
                (Value::Real(v), _) => Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
                (Value::Text(v), _) => JsonValue::String(v.clone()),
                (Value::Blob(_), _) => {
                    return Err(CoreError::invalid_entity(
                        self.table_id,
                        format!("{} holds a blob", field.name),
                    ))
                }
            };
            object.insert(field.name.clone(), value);
        }
        Ok(JsonValue::Object(object))
    }

    /// Converts a received JSON entity to insert parameters, in field order.
    pub fn json_to_params(&self, entity: &JsonValue) -> CoreResult<Vec<Value>> {
        let object = entity
            .as_object()
            .ok_or_else(|| CoreError::invalid_entity(self.table_id, "entity is not an object"))?;
        self.fields
            .iter()
            .map(|field| {
                let invalid = |what: &str| {
                    CoreError::invalid_entity(self.table_id, format!("{}: {what}", field.name))
                };
                match object.get(&field.name) {
                    None | Some(JsonValue::Null) if field.nullable => Ok(Value::Null),
                    None | Some(JsonValue::Null) => Err(invalid("missing value")),
                    Some(json) => match field.field_type {
                        FieldType::Integer => json
                            .as_i64()
                            .map(Value::Integer)
                            .ok_or_else(|| invalid("expected integer")),
                        FieldType::Real => json
                            .as_f64()
                            .map(Value::Real)
                            .ok_or_else(|| invalid("expected number")),
                        FieldType::Text => json
                            .as_str()
                            .map(Value::from)
                            .ok_or_else(|| invalid("expected string")),
                        FieldType::Boolean => json
                            .as_bool()
                            .or_else(|| json.as_i64().map(|v| v != 0))
                            .map(Value::from)
                            .ok_or_else(|| invalid("expected boolean")),
                    },
                }
            })
            .collect()
    }

    /// Extracts `(pk1, pk2)` from a JSON entity; `pk2` is 0 for single keys.
    pub fn key_of(&self, entity: &JsonValue) -> CoreResult<(i64, i64)> {
        let pk1 = self.integer_of(entity, self.pk1())?;
        let pk2 = match self.pk2() {
            Some(field) => self.integer_of(entity, field)?,
            None => 0,
        };
        Ok((pk1, pk2))
    }

    /// Extracts the version from a JSON entity.
    pub fn version_of(&self, entity: &JsonValue) -> CoreResult<i64> {
        self.integer_of(entity, &self.version_field)
    }

    /// Key parameters for the select-by-key statements.
    pub fn key_params(&self, pk1: i64, pk2: i64) -> Vec<Value> {
        if self.has_composite_key() {
            vec![Value::Integer(pk1), Value::Integer(pk2)]
        } else {
            vec![Value::Integer(pk1)]
        }
    }

    fn integer_of(&self, entity: &JsonValue, field: &str) -> CoreResult<i64> {
        entity
            .get(field)
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| {
                CoreError::invalid_entity(self.table_id, format!("{field}: expected integer"))
            })
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// All replicated entity metadata of a database, keyed by table id.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: BTreeMap<i32, ReplicationEntityMetaData>,
}

impl MetadataRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry, validating each entry.
    pub fn from_entities(
        entities: impl IntoIterator<Item = ReplicationEntityMetaData>,
    ) -> CoreResult<Self> {
        let mut registry = Self::new();
        for metadata in entities {
            registry.register(metadata)?;
        }
        Ok(registry)
    }

    /// Parses a JSON array of metadata.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let entities: Vec<ReplicationEntityMetaData> = serde_json::from_str(json)?;
        Self::from_entities(entities)
    }

    /// Adds one entry.
    pub fn register(&mut self, metadata: ReplicationEntityMetaData) -> CoreResult<()> {
        metadata.validate()?;
        if self.entities.contains_key(&metadata.table_id) {
            return Err(CoreError::invalid_metadata(
                metadata.table_id,
                "table id registered twice",
            ));
        }
        self.entities.insert(metadata.table_id, metadata);
        Ok(())
    }

    /// Returns metadata for a table id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownTable`] if the id is not registered.
    pub fn get(&self, table_id: i32) -> CoreResult<&ReplicationEntityMetaData> {
        self.entities
            .get(&table_id)
            .ok_or(CoreError::UnknownTable { table_id })
    }

    /// Iterates over entries in table id order.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicationEntityMetaData> {
        self.entities.values()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_storage::{SqliteBackend, StorageBackend, StorageError, TransactionMode};
    use serde_json::json;

    fn post() -> ReplicationEntityMetaData {
        ReplicationEntityMetaData::new(
            543,
            "DiscussionPost",
            "postUid",
            "postLastModified",
            vec![
                EntityField::new("postUid", FieldType::Integer),
                EntityField::nullable("postTitle", FieldType::Text),
                EntityField::new("postLastModified", FieldType::Integer),
                EntityField::new("postPinned", FieldType::Boolean),
            ],
        )
    }

    fn backend(meta: &ReplicationEntityMetaData) -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.execute_batch(&meta.install_sql()).unwrap();
        backend
    }

    fn insert(backend: &SqliteBackend, meta: &ReplicationEntityMetaData, entity: JsonValue) {
        let params = meta.json_to_params(&entity).unwrap();
        backend
            .transaction(TransactionMode::ReadWrite, |conn| {
                conn.prepare(&meta.remote_insert_sql())?.execute(&params)?;
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    fn stored(backend: &SqliteBackend, meta: &ReplicationEntityMetaData, pk: i64) -> Option<JsonValue> {
        backend
            .transaction(TransactionMode::ReadOnly, |conn| {
                let row = conn
                    .prepare(&meta.select_by_key_sql())?
                    .query(&meta.key_params(pk, 0))?
                    .next();
                row.map(|r| meta.row_to_json(&r)).transpose()
            })
            .unwrap()
    }

    fn entity(pk: i64, title: &str, version: i64) -> JsonValue {
        json!({ "postUid": pk, "postTitle": title, "postLastModified": version, "postPinned": false })
    }

    #[test]
    fn validate_rejects_bad_metadata() {
        assert!(post().validate().is_ok());

        let mut bad = post();
        bad.version_field = "postTitle".into();
        assert!(bad.validate().is_err());

        let mut bad = post();
        bad.entity_table_name = "Post; DROP TABLE x".into();
        assert!(bad.validate().is_err());

        let bad = post().with_second_key("missing");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn receive_view_keeps_newer_version() {
        let meta = post();
        let backend = backend(&meta);

        insert(&backend, &meta, entity(1, "first", 10));
        insert(&backend, &meta, entity(1, "older", 5));
        assert_eq!(stored(&backend, &meta, 1).unwrap()["postTitle"], "first");

        insert(&backend, &meta, entity(1, "tie", 10));
        assert_eq!(stored(&backend, &meta, 1).unwrap()["postTitle"], "first");

        insert(&backend, &meta, entity(1, "newer", 11));
        assert_eq!(stored(&backend, &meta, 1).unwrap()["postTitle"], "newer");
    }

    #[test]
    fn upsert_keeps_newer_version() {
        let meta = post().with_remote_insert_strategy(RemoteInsertStrategy::Upsert);
        let backend = backend(&meta);

        insert(&backend, &meta, entity(2, "first", 10));
        insert(&backend, &meta, entity(2, "older", 9));
        assert_eq!(stored(&backend, &meta, 2).unwrap()["postTitle"], "first");
        insert(&backend, &meta, entity(2, "newer", 12));
        assert_eq!(stored(&backend, &meta, 2).unwrap()["postTitle"], "newer");
    }

    #[test]
    fn json_conversion_checks_types() {
        let meta = post();
        assert!(meta
            .json_to_params(&json!({ "postUid": "x", "postLastModified": 1, "postPinned": true }))
            .is_err());
        assert!(meta.json_to_params(&json!([1, 2])).is_err());

        let params = meta
            .json_to_params(&json!({ "postUid": 1, "postLastModified": 2, "postPinned": true }))
            .unwrap();
        assert_eq!(
            params,
            vec![Value::Integer(1), Value::Null, Value::Integer(2), Value::Integer(1)]
        );
    }

    #[test]
    fn booleans_round_trip_as_json_bools() {
        let meta = post();
        let backend = backend(&meta);
        insert(
            &backend,
            &meta,
            json!({ "postUid": 3, "postTitle": null, "postLastModified": 1, "postPinned": true }),
        );
        let json = stored(&backend, &meta, 3).unwrap();
        assert_eq!(json["postPinned"], JsonValue::Bool(true));
        assert_eq!(json["postTitle"], JsonValue::Null);
    }

    #[test]
    fn composite_key_sql() {
        let meta = ReplicationEntityMetaData::new(
            7,
            "Membership",
            "groupUid",
            "lct",
            vec![
                EntityField::new("groupUid", FieldType::Integer),
                EntityField::new("personUid", FieldType::Integer),
                EntityField::new("lct", FieldType::Integer),
            ],
        )
        .with_second_key("personUid");
        meta.validate().unwrap();
        assert!(meta
            .select_by_key_sql()
            .ends_with("WHERE Membership.groupUid = ? AND Membership.personUid = ?"));
        assert_eq!(meta.key_of(&json!({"groupUid": 1, "personUid": 2, "lct": 3})).unwrap(), (1, 2));
        assert_eq!(meta.key_params(1, 2).len(), 2);
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown_ids() {
        let mut registry = MetadataRegistry::from_entities([post()]).unwrap();
        assert!(registry.register(post()).is_err());
        assert!(matches!(
            registry.get(1),
            Err(CoreError::UnknownTable { table_id: 1 })
        ));
        assert_eq!(registry.len(), 1);
    }
}
