//! CLI command implementations.

pub mod nodes;
pub mod pending;
pub mod serve;

use door_core::{DoorDatabase, DoorDatabaseConfig, MetadataRegistry};
use std::path::Path;

/// Output format of the inspection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl Format {
    /// Parses a `--format` value.
    pub fn parse(format: &str) -> Result<Self, Box<dyn std::error::Error>> {
        match format {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(format!("Unknown format {other:?}, expected text or json").into()),
        }
    }
}

/// Opens the database at `path` with the entities described in `schema`.
///
/// Without a schema file no entity is replicated; the node registry and
/// queue are still readable.
pub fn open_database(
    path: &Path,
    schema: Option<&Path>,
    node_id: Option<i64>,
    node_auth: Option<&str>,
) -> Result<DoorDatabase, Box<dyn std::error::Error>> {
    let registry = match schema {
        Some(schema) => {
            let json = std::fs::read_to_string(schema)
                .map_err(|e| format!("Cannot read schema {}: {e}", schema.display()))?;
            MetadataRegistry::from_json(&json)?
        }
        None => MetadataRegistry::new(),
    };

    let mut config = DoorDatabaseConfig::new();
    if let Some(node_id) = node_id {
        config = config.with_local_node_id(node_id);
    }
    if let Some(auth) = node_auth {
        config = config.with_local_node_auth(auth);
    }
    Ok(DoorDatabase::open_path(path, registry, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"[{
        "tableId": 543,
        "entityTableName": "DiscussionPost",
        "primaryKeyFields": ["postUid"],
        "versionField": "postLastModified",
        "fields": [
            {"name": "postUid", "type": "integer"},
            {"name": "postLastModified", "type": "integer"}
        ]
    }]"#;

    #[test]
    fn opens_with_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("schema.json");
        std::fs::write(&schema, SCHEMA).unwrap();

        let db = open_database(&dir.path().join("door.db"), Some(&schema), Some(5), Some("s"))
            .unwrap();
        assert_eq!(db.local_node_id(), 5);
        assert_eq!(db.registry().len(), 1);
    }

    #[test]
    fn node_identity_is_kept_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("door.db");
        let first = open_database(&path, None, None, None).unwrap();
        let id = first.local_node_id();
        drop(first);

        let second = open_database(&path, None, None, None).unwrap();
        assert_eq!(second.local_node_id(), id);
    }

    #[test]
    fn parses_formats() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert!(Format::parse("yaml").is_err());
    }
}
