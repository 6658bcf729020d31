//! Replication messages.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// The kind of a [`DoorMessage`] or [`crate::NodeEvent`].
///
/// Encoded on the wire as an integer `what` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageKind {
    /// Acknowledgment-gated replication between connected nodes.
    Replication,
    /// One-shot push, kept for peers that still send it.
    ReplicationPush,
}

impl MessageKind {
    /// Wire value of [`MessageKind::Replication`].
    pub const REPLICATION: i32 = 1;
    /// Wire value of [`MessageKind::ReplicationPush`].
    pub const REPLICATION_PUSH: i32 = 2;
}

impl From<MessageKind> for i32 {
    fn from(kind: MessageKind) -> i32 {
        match kind {
            MessageKind::Replication => MessageKind::REPLICATION,
            MessageKind::ReplicationPush => MessageKind::REPLICATION_PUSH,
        }
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(code: i32) -> ProtocolResult<Self> {
        match code {
            MessageKind::REPLICATION => Ok(MessageKind::Replication),
            MessageKind::REPLICATION_PUSH => Ok(MessageKind::ReplicationPush),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One replicated entity on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorReplicationEntity {
    /// Table id of the entity.
    pub table_id: i32,
    /// Sender's outgoing queue id for this delivery.
    pub or_uid: i64,
    /// The entity as a JSON object keyed by column name.
    pub entity: serde_json::Value,
}

/// A batch of replicated entities sent from one node to another.
///
/// Entities for the same table must be contiguous; receivers apply one
/// table group at a time. Use [`DoorMessage::sort_by_table`] when building a
/// message from unordered input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorMessage {
    /// Message kind.
    pub what: MessageKind,
    /// Sending node id.
    pub from_node: i64,
    /// Receiving node id.
    pub to_node: i64,
    /// Replicated entities.
    #[serde(default)]
    pub replications: Vec<DoorReplicationEntity>,
}

impl DoorMessage {
    /// Creates a [`MessageKind::Replication`] message.
    pub fn replication(
        from_node: i64,
        to_node: i64,
        replications: Vec<DoorReplicationEntity>,
    ) -> Self {
        Self {
            what: MessageKind::Replication,
            from_node,
            to_node,
            replications,
        }
    }

    /// Returns true if the message carries no entities.
    pub fn is_empty(&self) -> bool {
        self.replications.is_empty()
    }

    /// Returns the number of entities carried.
    pub fn len(&self) -> usize {
        self.replications.len()
    }

    /// Returns the sender queue ids of all entities, in message order.
    pub fn or_uids(&self) -> Vec<i64> {
        self.replications.iter().map(|r| r.or_uid).collect()
    }

    /// Stable-sorts entities by table id so each table forms one group.
    pub fn sort_by_table(&mut self) {
        self.replications.sort_by_key(|r| r.table_id);
    }

    /// Iterates over contiguous runs of entities sharing a table id.
    pub fn table_groups(&self) -> impl Iterator<Item = (i32, &[DoorReplicationEntity])> {
        self.replications
            .chunk_by(|a, b| a.table_id == b.table_id)
            .map(|group| (group[0].table_id, group))
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Acknowledges the `orUid`s a receiver has durably applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReceivedAck {
    /// Sender queue ids that were applied.
    #[serde(default)]
    pub replication_uids: Vec<i64>,
}

impl ReplicationReceivedAck {
    /// Creates an ack.
    pub fn new(replication_uids: Vec<i64>) -> Self {
        Self { replication_uids }
    }

    /// Returns true if nothing is acknowledged.
    pub fn is_empty(&self) -> bool {
        self.replication_uids.is_empty()
    }

    /// Encodes to JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
