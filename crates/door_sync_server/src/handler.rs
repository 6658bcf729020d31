//! Request handlers for the replication endpoints.

use crate::auth::{authorize, NodeCredentials};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use door_core::{DoorDatabase, NodeEventManager};
use door_storage::StorageBackend;
use door_sync_protocol::{DoorMessage, ReplicationReceivedAck};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared state of all handlers.
pub struct HandlerContext<B: StorageBackend> {
    /// Server configuration.
    pub config: ServerConfig,
    /// Event manager of the served database. Incoming messages are applied
    /// through it so that other subscribers see them.
    pub events: Arc<NodeEventManager<B>>,
}

impl<B: StorageBackend> HandlerContext<B> {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, events: Arc<NodeEventManager<B>>) -> Self {
        Self { config, events }
    }

    /// Returns the served database.
    pub fn database(&self) -> &DoorDatabase<B> {
        self.events.database()
    }
}

/// Result of a fetch: the next batch, or the time the queue was seen empty.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingResponse {
    /// Entities pending for the caller.
    Batch(DoorMessage),
    /// Nothing pending; server time in epoch millis.
    Drained {
        /// When the queue was read.
        timestamp: i64,
    },
}

/// Handler for replication requests.
pub struct RequestHandler<B: StorageBackend> {
    context: Arc<HandlerContext<B>>,
}

impl<B: StorageBackend> RequestHandler<B> {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext<B>>) -> Self {
        Self { context }
    }

    /// Authenticates the caller, registering it if allowed.
    pub async fn authenticate(&self, credentials: &NodeCredentials) -> ServerResult<()> {
        let db = self.context.database().clone();
        let credentials = credentials.clone();
        let auto_register = self.context.config.auto_register_nodes;
        tokio::task::spawn_blocking(move || authorize(&db, &credentials, auto_register))
            .await
            .map_err(door_core::CoreError::from)?
    }

    /// Returns the local node id.
    pub fn handle_node_id(&self) -> i64 {
        self.context.database().local_node_id()
    }

    /// Applies a message posted by `caller` and returns its acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidRequest`] if the message names another
    /// sender or recipient. Apply errors are passed through; nothing is
    /// acknowledged then.
    pub async fn handle_message(
        &self,
        caller: i64,
        message: DoorMessage,
    ) -> ServerResult<ReplicationReceivedAck> {
        let local_node_id = self.context.database().local_node_id();
        if message.from_node != caller {
            return Err(ServerError::InvalidRequest(format!(
                "message from node {} posted by node {caller}",
                message.from_node
            )));
        }
        if message.to_node != local_node_id {
            return Err(ServerError::InvalidRequest(format!(
                "message for node {} posted to node {local_node_id}",
                message.to_node
            )));
        }

        let count = message.len();
        let ack = self.context.events.on_incoming_message_received(message).await?;
        tracing::debug!(
            remote_node_id = caller,
            count,
            acknowledged = ack.replication_uids.len(),
            "received replications"
        );
        Ok(ack)
    }

    /// Deletes what `caller` acknowledged and returns its next batch.
    pub async fn handle_ack_and_get_pending(
        &self,
        caller: i64,
        ack: ReplicationReceivedAck,
    ) -> ServerResult<PendingResponse> {
        let db = self.context.database().clone();
        let limit = self.context.config.max_batch_size;
        let message = tokio::task::spawn_blocking(move || {
            db.acknowledge_and_select_next_batch(caller, &ack, limit)
        })
        .await
        .map_err(door_core::CoreError::from)??;

        if message.is_empty() {
            Ok(PendingResponse::Drained {
                timestamp: now_millis(),
            })
        } else {
            tracing::debug!(remote_node_id = caller, count = message.len(), "sending replications");
            Ok(PendingResponse::Batch(message))
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
