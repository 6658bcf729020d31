//! Node event manager.
//!
//! Turns commits that touch `OutgoingReplication` into [`NodeEvent`]s, and
//! rebroadcasts messages received from peers. Both streams are tokio
//! broadcast channels: every subscriber sees every event sent after it
//! subscribed, up to the channel capacity.
//!
//! Invalidations are coalesced through a single-slot channel. However many
//! commits land while the watcher is busy, it runs at most one more query
//! afterwards. The query reads rows above a watermark, so no row is
//! reported twice and none is skipped.

use crate::config::NodeEventConfig;
use crate::database::DoorDatabase;
use crate::entities::OUTGOING_REPLICATION_TABLE;
use crate::error::{CoreError, CoreResult};
use crate::replication::ApplyOutcome;
use door_storage::{ListenerId, StorageBackend};
use door_sync_protocol::{DoorMessage, MessageKind, NodeEvent, ReplicationReceivedAck};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Emits outgoing node events and incoming messages for one database.
pub struct NodeEventManager<B: StorageBackend> {
    db: DoorDatabase<B>,
    outgoing_tx: broadcast::Sender<NodeEvent>,
    incoming_tx: broadcast::Sender<DoorMessage>,
    listener: ListenerId,
    watcher: JoinHandle<()>,
    closed: AtomicBool,
}

impl<B: StorageBackend> NodeEventManager<B> {
    /// Starts the manager.
    ///
    /// Must be called from within a tokio runtime. Rows already queued when
    /// the manager starts produce no events.
    pub fn start(db: DoorDatabase<B>, config: NodeEventConfig) -> CoreResult<Arc<Self>> {
        let (outgoing_tx, _) = broadcast::channel(config.channel_capacity);
        let (incoming_tx, _) = broadcast::channel(config.channel_capacity);
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

        let watermark = db.max_outgoing_uid()?;
        let listener = db
            .backend()
            .invalidation_tracker()
            .add_listener([OUTGOING_REPLICATION_TABLE], move |_| {
                let _ = signal_tx.try_send(());
            });

        let watcher = tokio::spawn(watch_outgoing(
            db.clone(),
            outgoing_tx.clone(),
            signal_rx,
            watermark,
            config.watch_batch_size,
        ));
        tracing::debug!(local_node_id = db.local_node_id(), watermark, "node event manager started");

        Ok(Arc::new(Self {
            db,
            outgoing_tx,
            incoming_tx,
            listener,
            watcher,
            closed: AtomicBool::new(false),
        }))
    }

    /// Subscribes to outgoing events.
    pub fn subscribe_outgoing(&self) -> broadcast::Receiver<NodeEvent> {
        self.outgoing_tx.subscribe()
    }

    /// Subscribes to messages received from peers.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<DoorMessage> {
        self.incoming_tx.subscribe()
    }

    /// Returns the database this manager watches.
    pub fn database(&self) -> &DoorDatabase<B> {
        &self.db
    }

    /// Applies a message received from a peer, then rebroadcasts it to
    /// local subscribers.
    ///
    /// Returns the acknowledgment for the sender: every `orUid` in the
    /// message, since entities that were not newer are already current
    /// here.
    ///
    /// # Errors
    ///
    /// Returns the apply error (nothing is broadcast or acknowledged then),
    /// or [`CoreError::Closed`] after [`Self::close`].
    pub async fn on_incoming_message_received(
        &self,
        message: DoorMessage,
    ) -> CoreResult<ReplicationReceivedAck> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        let outcome = self.apply(message.clone()).await?;
        let _ = self.incoming_tx.send(message);
        Ok(ReplicationReceivedAck::new(outcome.received))
    }

    async fn apply(&self, message: DoorMessage) -> CoreResult<ApplyOutcome> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.insert_entities_from_message(&message)).await?
    }

    /// Stops watching for invalidations. Existing subscriptions end once
    /// the manager is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.db
            .backend()
            .invalidation_tracker()
            .remove_listener(self.listener);
        self.watcher.abort();
        tracing::debug!(local_node_id = self.db.local_node_id(), "node event manager closed");
    }

    /// Returns true once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<B: StorageBackend> Drop for NodeEventManager<B> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn watch_outgoing<B: StorageBackend>(
    db: DoorDatabase<B>,
    outgoing_tx: broadcast::Sender<NodeEvent>,
    mut signal_rx: mpsc::Receiver<()>,
    mut watermark: i64,
    batch_size: usize,
) {
    while signal_rx.recv().await.is_some() {
        loop {
            let query_db = db.clone();
            let after = watermark;
            let result = tokio::task::spawn_blocking(move || {
                query_db.outgoing_replications_after(after, batch_size)
            })
            .await;

            let rows = match result {
                Ok(Ok(rows)) => rows,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, watermark, "failed to read outgoing replications");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "outgoing replication query task failed");
                    break;
                }
            };
            let full = rows.len() >= batch_size;
            if let Some(last) = rows.last() {
                watermark = last.or_uid;
            }
            tracing::trace!(count = rows.len(), watermark, "new outgoing replications");
            for row in rows {
                let _ = outgoing_tx.send(NodeEvent {
                    what: MessageKind::Replication,
                    to_node: row.dest_node_id,
                    table_id: row.or_table_id,
                    key1: row.or_pk1,
                    key2: row.or_pk2,
                });
            }
            if !full {
                break;
            }
        }
    }
}
