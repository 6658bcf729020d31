//! Node registry commands.

use super::Format;
use door_core::{DoorDatabase, DoorNode};
use serde::Serialize;
use std::io::Write;

/// A node as listed; the secret is never printed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    /// Node id.
    pub node_id: i64,
    /// Whether the node can authenticate.
    pub has_auth: bool,
    /// Database endpoint, if known.
    pub endpoint: Option<String>,
    /// Rows queued for the node.
    pub pending: i64,
}

/// Lists the local node and every known remote node.
pub fn list(
    db: &DoorDatabase,
    format: &str,
    out: &mut impl Write,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let pending = db.pending_counts()?;
    let entries: Vec<NodeEntry> = db
        .list_nodes()?
        .into_iter()
        .map(|node| NodeEntry {
            has_auth: !node.auth.is_empty(),
            pending: pending
                .iter()
                .find(|(dest, _)| *dest == node.node_id)
                .map_or(0, |(_, count)| *count),
            node_id: node.node_id,
            endpoint: node.endpoint,
        })
        .collect();

    match format {
        Format::Json => {
            let listing = serde_json::json!({
                "localNodeId": db.local_node_id(),
                "nodes": entries,
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&listing)?)?;
        }
        Format::Text => {
            writeln!(out, "local node {}", db.local_node_id())?;
            for entry in &entries {
                writeln!(
                    out,
                    "node {:>8}  {:<6} {:>8} pending  {}",
                    entry.node_id,
                    if entry.has_auth { "auth" } else { "-" },
                    entry.pending,
                    entry.endpoint.as_deref().unwrap_or("-"),
                )?;
            }
        }
    }
    Ok(())
}

/// Registers a node.
pub fn add(
    db: &DoorDatabase,
    node_id: i64,
    auth: &str,
    endpoint: Option<String>,
    backfill: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if node_id == db.local_node_id() {
        return Err(format!("Node {node_id} is the local node").into());
    }
    let mut node = DoorNode::new(node_id, auth);
    node.endpoint = endpoint;
    if db.register_node(&node, backfill)? {
        tracing::info!(remote_node_id = node_id, backfill, "registered node");
    } else {
        return Err(format!("Node {node_id} is already registered").into());
    }
    Ok(())
}
