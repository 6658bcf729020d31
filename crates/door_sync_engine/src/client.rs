//! Replication client.
//!
//! One [`ReplicationClient`] keeps a local node and one peer in sync. It runs
//! four tasks sharing one shutdown signal:
//!
//! - **handshake**: asks the peer for its node id until it answers, then
//!   registers the peer (with backfill) so local writes are queued for it
//! - **send loop**: acknowledges what the peer confirmed, selects the next
//!   batch of pending rows and posts it
//! - **fetch loop**: acknowledges what was received and asks the peer for its
//!   next batch, applying it through the node event manager
//! - **event wake-up**: turns node events for this peer into send signals and
//!   messages from this peer into fetch signals
//!
//! Both loops wait on a single-slot signal only when they have nothing to
//! acknowledge, so the acknowledgment of batch N rides on the request that
//! carries batch N+1. Failed round trips keep their pending acknowledgments
//! and run again after the retry interval.

use crate::config::ReplicationClientConfig;
use crate::error::{SyncError, SyncResult};
use crate::state::ClientState;
use crate::transport::{FetchOutcome, ReplicationTransport};
use door_core::{CoreError, CoreResult, DoorNode, NodeEventManager};
use door_storage::StorageBackend;
use door_sync_protocol::{DoorMessage, MessageKind, NodeEvent, ReplicationReceivedAck};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Replicates between the local node and one peer.
///
/// Dropping the client closes it.
pub struct ReplicationClient {
    endpoint: String,
    state_rx: watch::Receiver<ClientState>,
    shutdown_tx: watch::Sender<bool>,
    send_tx: mpsc::Sender<()>,
    fetch_tx: mpsc::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationClient {
    /// Starts replicating with the peer at `config.endpoint`.
    ///
    /// Must be called from within a tokio runtime. The first send and fetch
    /// passes run as soon as the handshake completes.
    pub fn start<B, T>(
        config: ReplicationClientConfig,
        events: Arc<NodeEventManager<B>>,
        transport: T,
    ) -> Self
    where
        B: StorageBackend,
        T: ReplicationTransport,
    {
        let (state_tx, state_rx) = watch::channel(ClientState::default());
        let (shutdown_tx, _) = watch::channel(false);
        let (send_tx, send_rx) = mpsc::channel(1);
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let _ = send_tx.try_send(());
        let _ = fetch_tx.try_send(());

        let outgoing = events.subscribe_outgoing();
        let incoming = events.subscribe_incoming();
        let endpoint = config.endpoint.clone();
        let poll_interval = config.poll_interval;
        tracing::info!(
            local_node_id = config.local_node_id,
            endpoint = %endpoint,
            "starting replication client"
        );

        let shared = Arc::new(Shared {
            config,
            events,
            transport,
            state_tx,
        });
        let mut tasks = vec![
            tokio::spawn(run_handshake(Arc::clone(&shared), shutdown_tx.subscribe())),
            tokio::spawn(run_send_loop(
                Arc::clone(&shared),
                send_rx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_fetch_loop(
                Arc::clone(&shared),
                fetch_rx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_event_wakeup(
                Arc::clone(&shared),
                outgoing,
                incoming,
                send_tx.clone(),
                fetch_tx.clone(),
                shutdown_tx.subscribe(),
            )),
        ];
        if let Some(period) = poll_interval {
            tasks.push(tokio::spawn(run_poll(
                period,
                fetch_tx.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        Self {
            endpoint,
            state_rx,
            shutdown_tx,
            send_tx,
            fetch_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Returns the peer endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    /// Returns the current state.
    pub fn current_state(&self) -> ClientState {
        self.state_rx.borrow().clone()
    }

    /// Returns the peer node id once the handshake has completed.
    pub fn remote_node_id(&self) -> Option<i64> {
        self.state_rx.borrow().remote_node_id
    }

    /// Asks the peer for pending data now, e.g. after a push notification.
    pub fn notify_remote_pending(&self) {
        let _ = self.fetch_tx.try_send(());
    }

    /// Runs a send pass now, e.g. after another process queued rows in the
    /// same database file.
    pub fn notify_local_pending(&self) {
        let _ = self.send_tx.try_send(());
    }

    /// Waits until the handshake completes and returns the peer node id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] if the client is closed first.
    pub async fn wait_initialized(&self) -> SyncResult<i64> {
        let mut state = self.state_rx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let wait = async move {
            state
                .wait_for(|s| s.remote_node_id.is_some())
                .await
                .ok()
                .and_then(|s| s.remote_node_id)
        };
        until_shutdown(&mut shutdown, wait)
            .await
            .flatten()
            .ok_or(SyncError::Closed)
    }

    /// Stops all tasks. In-flight requests are abandoned.
    pub fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(endpoint = %self.endpoint, "replication client closed");
    }

    /// Returns true once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ReplicationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationClient")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

struct Shared<B: StorageBackend, T> {
    config: ReplicationClientConfig,
    events: Arc<NodeEventManager<B>>,
    transport: T,
    state_tx: watch::Sender<ClientState>,
}

impl<B: StorageBackend, T: ReplicationTransport> Shared<B, T> {
    async fn handshake(&self) -> SyncResult<i64> {
        let remote = self.transport.get_node_id().await?;
        let db = self.events.database().clone();
        let node = DoorNode::new(remote, "").with_endpoint(self.config.endpoint.as_str());
        let registered = blocking(move || db.register_node(&node, true)).await?;
        tracing::info!(
            local_node_id = self.config.local_node_id,
            remote_node_id = remote,
            registered,
            "handshake complete"
        );
        Ok(remote)
    }

    async fn remote_node_id(&self, shutdown: &mut watch::Receiver<bool>) -> Option<i64> {
        let mut state = self.state_tx.subscribe();
        let wait = async move {
            state
                .wait_for(|s| s.remote_node_id.is_some())
                .await
                .ok()
                .and_then(|s| s.remote_node_id)
        };
        until_shutdown(shutdown, wait).await.flatten()
    }

    async fn send_pass(&self, remote: i64, to_ack: &mut Vec<i64>) -> SyncResult<()> {
        let db = self.events.database().clone();
        let ack = ReplicationReceivedAck::new(to_ack.clone());
        let batch_size = self.config.batch_size;
        let message =
            blocking(move || db.acknowledge_and_select_next_batch(remote, &ack, batch_size)).await?;
        to_ack.clear();
        if message.is_empty() {
            tracing::trace!(remote_node_id = remote, "nothing to send");
            return Ok(());
        }

        let count = message.len();
        let received = self.transport.send_message(&message).await?;
        tracing::debug!(
            remote_node_id = remote,
            count,
            acknowledged = received.replication_uids.len(),
            "sent replications"
        );
        *to_ack = received.replication_uids;
        self.state_tx.send_modify(|s| {
            s.batches_sent += 1;
            s.entities_sent += count as u64;
        });
        Ok(())
    }

    async fn fetch_pass(&self, remote: i64, to_ack: &mut Vec<i64>) -> SyncResult<()> {
        let ack = ReplicationReceivedAck::new(to_ack.clone());
        let outcome = self.transport.ack_and_get_pending(&ack).await?;
        to_ack.clear();
        match outcome {
            FetchOutcome::Message(message) => {
                let count = message.len();
                let received = self.events.on_incoming_message_received(message).await?;
                tracing::debug!(remote_node_id = remote, count, "received replications");
                *to_ack = received.replication_uids;
                self.state_tx.send_modify(|s| {
                    s.batches_received += 1;
                    s.entities_received += count as u64;
                });
            }
            FetchOutcome::Drained { timestamp } => {
                let timestamp = timestamp.unwrap_or_else(now_millis);
                tracing::trace!(remote_node_id = remote, timestamp, "peer has nothing pending");
                self.state_tx
                    .send_modify(|s| s.last_receive_complete_time = Some(timestamp));
            }
        }
        Ok(())
    }

    fn record_failure(&self, task: &'static str, err: &SyncError) {
        self.state_tx.send_modify(|s| s.retries += 1);
        let endpoint = self.config.endpoint.as_str();
        if err.is_retryable() {
            tracing::warn!(task, endpoint, error = %err, "replication round trip failed");
        } else {
            tracing::error!(task, endpoint, error = %err, "replication round trip failed");
        }
    }
}

async fn blocking<R, F>(f: F) -> SyncResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> CoreResult<R> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f)
        .await
        .map_err(CoreError::from)??)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Resolves once shutdown is requested or every sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Runs `fut` unless shutdown is requested first.
async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = shutdown_requested(shutdown) => None,
        out = fut => Some(out),
    }
}

async fn run_handshake<B, T>(shared: Arc<Shared<B, T>>, mut shutdown: watch::Receiver<bool>)
where
    B: StorageBackend,
    T: ReplicationTransport,
{
    loop {
        let Some(result) = until_shutdown(&mut shutdown, shared.handshake()).await else {
            return;
        };
        match result {
            Ok(remote) => {
                shared.state_tx.send_modify(|s| {
                    s.initialized = true;
                    s.remote_node_id = Some(remote);
                });
                return;
            }
            Err(err) if err.is_cancellation() => return,
            Err(err) => {
                shared.record_failure("handshake", &err);
                let delay = tokio::time::sleep(shared.config.retry_interval);
                if until_shutdown(&mut shutdown, delay).await.is_none() {
                    return;
                }
            }
        }
    }
}

async fn run_send_loop<B, T>(
    shared: Arc<Shared<B, T>>,
    mut notify: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) where
    B: StorageBackend,
    T: ReplicationTransport,
{
    let Some(remote) = shared.remote_node_id(&mut shutdown).await else {
        return;
    };
    let mut to_ack = Vec::new();
    let mut retry = false;
    loop {
        if to_ack.is_empty() && !retry {
            if !matches!(until_shutdown(&mut shutdown, notify.recv()).await, Some(Some(()))) {
                return;
            }
        }
        retry = false;
        let Some(result) = until_shutdown(&mut shutdown, shared.send_pass(remote, &mut to_ack)).await
        else {
            return;
        };
        if let Err(err) = result {
            if err.is_cancellation() {
                return;
            }
            shared.record_failure("send", &err);
            let delay = tokio::time::sleep(shared.config.retry_interval);
            if until_shutdown(&mut shutdown, delay).await.is_none() {
                return;
            }
            retry = true;
        }
    }
}

async fn run_fetch_loop<B, T>(
    shared: Arc<Shared<B, T>>,
    mut notify: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) where
    B: StorageBackend,
    T: ReplicationTransport,
{
    let Some(remote) = shared.remote_node_id(&mut shutdown).await else {
        return;
    };
    let mut to_ack = Vec::new();
    let mut retry = false;
    loop {
        if to_ack.is_empty() && !retry {
            if !matches!(until_shutdown(&mut shutdown, notify.recv()).await, Some(Some(()))) {
                return;
            }
        }
        retry = false;
        let Some(result) =
            until_shutdown(&mut shutdown, shared.fetch_pass(remote, &mut to_ack)).await
        else {
            return;
        };
        if let Err(err) = result {
            if err.is_cancellation() {
                return;
            }
            shared.record_failure("fetch", &err);
            let delay = tokio::time::sleep(shared.config.retry_interval);
            if until_shutdown(&mut shutdown, delay).await.is_none() {
                return;
            }
            retry = true;
        }
    }
}

async fn run_event_wakeup<B, T>(
    shared: Arc<Shared<B, T>>,
    mut outgoing: broadcast::Receiver<NodeEvent>,
    mut incoming: broadcast::Receiver<DoorMessage>,
    send_tx: mpsc::Sender<()>,
    fetch_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) where
    B: StorageBackend,
    T: ReplicationTransport,
{
    let Some(remote) = shared.remote_node_id(&mut shutdown).await else {
        return;
    };
    loop {
        tokio::select! {
            () = shutdown_requested(&mut shutdown) => return,
            event = outgoing.recv() => match event {
                Ok(event) if event.is_replication_for(remote) => {
                    let _ = send_tx.try_send(());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(remote_node_id = remote, skipped, "outgoing events lagged");
                    let _ = send_tx.try_send(());
                }
                Err(RecvError::Closed) => return,
            },
            message = incoming.recv() => match message {
                Ok(message) if message.from_node == remote && message.what == MessageKind::Replication => {
                    let _ = fetch_tx.try_send(());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    let _ = fetch_tx.try_send(());
                }
                Err(RecvError::Closed) => return,
            },
        }
    }
}

async fn run_poll(period: Duration, fetch_tx: mpsc::Sender<()>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown_requested(&mut shutdown) => return,
            _ = ticker.tick() => {
                let _ = fetch_tx.try_send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use door_core::{
        ChangeType, DoorDatabase, DoorDatabaseConfig, EntityField, FieldType, MetadataRegistry,
        NodeEventConfig, ReplicationEntityMetaData,
    };
    use door_storage::{SqliteBackend, Value};
    use door_sync_protocol::DoorReplicationEntity;

    const TABLE: i32 = 1;
    const LOCAL: i64 = 1;
    const REMOTE: i64 = 2;

    fn open() -> DoorDatabase<SqliteBackend> {
        let registry = MetadataRegistry::from_entities([ReplicationEntityMetaData::new(
            TABLE,
            "Item",
            "itemUid",
            "itemVersion",
            vec![
                EntityField::new("itemUid", FieldType::Integer),
                EntityField::new("itemVersion", FieldType::Integer),
            ],
        )])
        .unwrap();
        DoorDatabase::open_in_memory(registry, DoorDatabaseConfig::new().with_local_node_id(LOCAL))
            .unwrap()
    }

    fn write_item(db: &DoorDatabase<SqliteBackend>, uid: i64, version: i64) {
        db.write(|tx| {
            tx.execute(
                "REPLACE INTO Item (itemUid, itemVersion) VALUES (?, ?)",
                &[Value::Integer(uid), Value::Integer(version)],
            )?;
            tx.record_change(TABLE, uid, 0, ChangeType::Update)
        })
        .unwrap();
    }

    fn item_version(db: &DoorDatabase<SqliteBackend>, uid: i64) -> Option<i64> {
        db.read(|conn| {
            Ok(conn
                .prepare("SELECT itemVersion FROM Item WHERE itemUid = ?")?
                .query(&[Value::Integer(uid)])?
                .next()
                .and_then(|row| row.get_index(0).and_then(Value::as_i64)))
        })
        .unwrap()
    }

    fn start(
        db: &DoorDatabase<SqliteBackend>,
        mock: &Arc<MockTransport>,
    ) -> ReplicationClient {
        let events = NodeEventManager::start(db.clone(), NodeEventConfig::default()).unwrap();
        let config = ReplicationClientConfig::for_database(db, "http://peer/db/")
            .with_retry_interval(Duration::from_millis(20));
        ReplicationClient::start(config, events, Arc::clone(mock))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn handshake_retries_then_registers_peer() {
        let db = open();
        write_item(&db, 1, 1);
        let mock = Arc::new(MockTransport::new(REMOTE));
        mock.fail_handshakes(2);

        let client = start(&db, &mock);
        assert_eq!(client.wait_initialized().await.unwrap(), REMOTE);

        let state = client.current_state();
        assert!(state.initialized);
        assert_eq!(state.retries, 2);
        let peer = db.find_node(REMOTE).unwrap().unwrap();
        assert_eq!(peer.endpoint.as_deref(), Some("http://peer/db/"));

        // the backfilled row reaches the peer
        eventually(|| mock.sent().iter().any(|m| m.or_uids().len() == 1)).await;
    }

    #[tokio::test]
    async fn local_writes_are_sent_and_acknowledged() {
        let db = open();
        let mock = Arc::new(MockTransport::new(REMOTE));
        let client = start(&db, &mock);
        client.wait_initialized().await.unwrap();

        write_item(&db, 7, 1);
        eventually(|| {
            mock.sent()
                .iter()
                .flat_map(|m| m.replications.iter())
                .any(|r| r.entity["itemUid"] == 7)
        })
        .await;
        eventually(|| db.pending_counts().unwrap().is_empty()).await;

        let sent = mock.sent();
        assert!(sent.iter().all(|m| m.from_node == LOCAL && m.to_node == REMOTE));
        assert!(client.current_state().entities_sent >= 1);
    }

    #[tokio::test]
    async fn notify_local_pending_sends_unannounced_rows() {
        let db = open();
        let mock = Arc::new(MockTransport::new(REMOTE));
        let client = start(&db, &mock);
        client.wait_initialized().await.unwrap();
        eventually(|| mock.sent().is_empty() && db.pending_counts().unwrap().is_empty()).await;

        // queued without invalidation, so no node event announces it
        db.write(|tx| {
            tx.execute("INSERT INTO Item (itemUid, itemVersion) VALUES (9, 1)", &[])?;
            tx.execute(
                "INSERT INTO OutgoingReplication (destNodeId, orTableId, orPk1, orPk2) \
                 VALUES (?, ?, 9, 0)",
                &[Value::Integer(REMOTE), Value::from(TABLE)],
            )
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.sent().is_empty());

        client.notify_local_pending();
        eventually(|| mock.sent().iter().any(|m| m.replications.iter().any(|r| r.entity["itemUid"] == 9)))
            .await;
        eventually(|| db.pending_counts().unwrap().is_empty()).await;
    }

    #[tokio::test]
    async fn fetched_messages_are_applied_and_acknowledged_next_round() {
        let db = open();
        let mock = Arc::new(MockTransport::new(REMOTE));
        mock.push_pending(DoorMessage::replication(
            REMOTE,
            LOCAL,
            vec![DoorReplicationEntity {
                table_id: TABLE,
                or_uid: 31,
                entity: serde_json::json!({ "itemUid": 5, "itemVersion": 4 }),
            }],
        ));
        let client = start(&db, &mock);
        client.wait_initialized().await.unwrap();

        eventually(|| item_version(&db, 5) == Some(4)).await;
        eventually(|| mock.acks().iter().any(|a| a.replication_uids == vec![31])).await;
        let mut state = client.state();
        state.wait_for(ClientState::has_drained).await.unwrap();
        assert_eq!(client.current_state().entities_received, 1);
    }

    #[tokio::test]
    async fn offline_peer_is_retried_without_losing_data() {
        let db = open();
        let mock = Arc::new(MockTransport::new(REMOTE));
        let client = start(&db, &mock);
        client.wait_initialized().await.unwrap();

        mock.set_offline(true);
        write_item(&db, 9, 1);
        eventually(|| client.current_state().retries > 0).await;
        assert_eq!(db.pending_counts().unwrap(), vec![(REMOTE, 1)]);

        mock.set_offline(false);
        eventually(|| db.pending_counts().unwrap().is_empty()).await;
        assert!(mock
            .sent()
            .iter()
            .flat_map(|m| m.replications.iter())
            .any(|r| r.entity["itemUid"] == 9));
    }

    #[tokio::test]
    async fn closed_client_stops_sending() {
        let db = open();
        let mock = Arc::new(MockTransport::new(REMOTE));
        let client = start(&db, &mock);
        client.wait_initialized().await.unwrap();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.wait_initialized().await, Err(SyncError::Closed)));

        write_item(&db, 3, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.sent().is_empty());
        assert_eq!(db.pending_counts().unwrap(), vec![(REMOTE, 1)]);
    }
}
