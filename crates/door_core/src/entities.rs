//! Replication bookkeeping rows.

use crate::error::{CoreError, CoreResult};
use door_storage::Row;
use serde::{Deserialize, Serialize};

/// Table holding known peer nodes.
pub const DOOR_NODE_TABLE: &str = "DoorNode";
/// Table holding per-destination delivery obligations.
pub const OUTGOING_REPLICATION_TABLE: &str = "OutgoingReplication";
/// Table holding changed entities not yet fanned out.
pub const CHANGE_LOG_TABLE: &str = "ChangeLog";

fn table_id_from(stored: i64) -> CoreResult<i32> {
    i32::try_from(stored).map_err(|_| {
        CoreError::invalid_entity(0, format!("stored table id {stored} is out of range"))
    })
}

/// A known peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorNode {
    /// Node id.
    pub node_id: i64,
    /// Shared secret the node presents with its id.
    pub auth: String,
    /// Base URL of the node's database endpoint, if it serves one.
    pub endpoint: Option<String>,
}

impl DoorNode {
    /// Creates a node record.
    pub fn new(node_id: i64, auth: impl Into<String>) -> Self {
        Self {
            node_id,
            auth: auth.into(),
            endpoint: None,
        }
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub(crate) fn from_row(row: &Row) -> CoreResult<Self> {
        Ok(Self {
            node_id: row.get_i64("nodeId")?,
            auth: row.get_opt_text("auth")?.unwrap_or_default(),
            endpoint: row.get_opt_text("endpoint")?,
        })
    }
}

/// One pending delivery of an entity to a destination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingReplication {
    /// Queue id. Strictly increasing and never reused.
    pub or_uid: i64,
    /// Destination node.
    pub dest_node_id: i64,
    /// Table id of the entity.
    pub or_table_id: i32,
    /// First primary key component.
    pub or_pk1: i64,
    /// Second primary key component (0 when unused).
    pub or_pk2: i64,
}

impl OutgoingReplication {
    pub(crate) fn from_row(row: &Row) -> CoreResult<Self> {
        let table_id = row.get_i64("orTableId")?;
        Ok(Self {
            or_uid: row.get_i64("orUid")?,
            dest_node_id: row.get_i64("destNodeId")?,
            or_table_id: table_id_from(table_id)?,
            or_pk1: row.get_i64("orPk1")?,
            or_pk2: row.get_i64("orPk2")?,
        })
    }
}

/// Type of change recorded for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// Entity was inserted.
    Insert,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl ChangeType {
    /// Stored integer code.
    pub fn code(self) -> i64 {
        match self {
            ChangeType::Insert => 1,
            ChangeType::Update => 2,
            ChangeType::Delete => 3,
        }
    }

    /// Parses a stored integer code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ChangeType::Insert),
            2 => Some(ChangeType::Update),
            3 => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// An entity changed since the last fan-out.
///
/// At most one row exists per entity; recording a second change replaces the
/// change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeLog {
    /// Table id of the entity.
    pub ch_table_id: i32,
    /// First primary key component.
    pub ch_entity_pk: i64,
    /// Second primary key component (0 when unused).
    pub ch_entity_pk2: i64,
    /// Most recent change.
    pub ch_type: ChangeType,
}

impl ChangeLog {
    pub(crate) fn from_row(row: &Row) -> CoreResult<Self> {
        let table_id = row.get_i64("chTableId")?;
        let ch_table_id = table_id_from(table_id)?;
        let code = row.get_i64("chType")?;
        let ch_type = ChangeType::from_code(code).ok_or_else(|| {
            CoreError::invalid_entity(ch_table_id, format!("unknown change type {code}"))
        })?;
        Ok(Self {
            ch_table_id,
            ch_entity_pk: row.get_i64("chEntityPk")?,
            ch_entity_pk2: row.get_i64("chEntityPk2")?,
            ch_type,
        })
    }
}
