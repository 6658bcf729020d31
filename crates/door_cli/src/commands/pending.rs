//! Pending command implementation.

use super::Format;
use door_core::DoorDatabase;
use serde::Serialize;
use std::io::Write;

/// Queue depth for one destination node.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    /// Destination node id.
    pub dest_node_id: i64,
    /// Undelivered queue rows.
    pub pending: i64,
}

/// Runs the pending command.
pub fn run(
    db: &DoorDatabase,
    format: &str,
    out: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let entries: Vec<PendingEntry> = db
        .pending_counts()?
        .into_iter()
        .map(|(dest_node_id, pending)| PendingEntry {
            dest_node_id,
            pending,
        })
        .collect();

    match format {
        Format::Json => writeln!(out, "{}", serde_json::to_string_pretty(&entries)?)?,
        Format::Text if entries.is_empty() => writeln!(out, "Nothing pending")?,
        Format::Text => {
            for entry in &entries {
                writeln!(out, "node {:>8}  {:>8} pending", entry.dest_node_id, entry.pending)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_core::{DoorDatabaseConfig, DoorNode, MetadataRegistry};

    #[test]
    fn reports_empty_queue() {
        let db = DoorDatabase::open_in_memory(MetadataRegistry::new(), DoorDatabaseConfig::new())
            .unwrap();
        db.register_node(&DoorNode::new(2, "s"), true).unwrap();

        let mut out = Vec::new();
        run(&db, "text", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Nothing pending\n");

        let mut out = Vec::new();
        run(&db, "json", &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }
}
