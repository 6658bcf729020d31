//! Cross-crate integration helpers.
//!
//! Wires [`TestNode`]s together in-process: a node's [`SyncServer`] is
//! wrapped as a [`LoopbackServer`], and a peer's [`ReplicationClient`] talks
//! to it through a [`LoopbackClient`] and the real [`HttpTransport`]. Only
//! the socket is missing.

use crate::fixtures::TestNode;
use door_storage::{SqliteBackend, StorageBackend};
use door_sync_engine::{
    HttpClient, HttpRequest, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer,
    ReplicationClient, ReplicationClientConfig,
};
use door_sync_server::{ServerConfig, ServerRequest, SyncServer};
use door_sync_protocol::{HEADER_NODE_AUTH, HEADER_NODE_ID};
use std::sync::Arc;
use std::time::Duration;

/// Database endpoint used for in-process servers.
pub const LOOPBACK_ENDPOINT: &str = "http://loopback/db";

/// Retry interval used by test clients.
pub const TEST_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// A [`SyncServer`] reachable through a [`LoopbackClient`].
pub struct LoopbackSyncServer<B: StorageBackend> {
    server: Arc<SyncServer<B>>,
}

impl<B: StorageBackend> LoopbackSyncServer<B> {
    /// Wraps a server.
    pub fn new(server: Arc<SyncServer<B>>) -> Self {
        Self { server }
    }

    /// Returns the wrapped server.
    pub fn server(&self) -> &Arc<SyncServer<B>> {
        &self.server
    }
}

impl<B: StorageBackend> LoopbackServer for LoopbackSyncServer<B> {
    async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let response = self
            .server
            .handle(ServerRequest {
                path: request.path(),
                node_id: request.header(HEADER_NODE_ID),
                node_auth: request.header(HEADER_NODE_AUTH),
                body: &request.body,
            })
            .await;

        let mut converted = HttpResponse::status(response.status);
        converted.body = response.body;
        for (name, value) in response.headers {
            converted = converted.with_header(name, value);
        }
        converted
    }
}

/// Loopback client type returned by [`serve_in_process`].
pub type InProcessClient = LoopbackClient<LoopbackSyncServer<SqliteBackend>>;

/// Serves `node` under [`LOOPBACK_ENDPOINT`] and returns a client for it.
pub fn serve_in_process(node: &TestNode) -> InProcessClient {
    serve_in_process_with(node, ServerConfig::default())
}

/// Like [`serve_in_process`] with a custom configuration. The base path is
/// always `/db`.
pub fn serve_in_process_with(node: &TestNode, config: ServerConfig) -> InProcessClient {
    let server = SyncServer::new(config.with_base_path("/db"), Arc::clone(&node.events));
    LoopbackClient::new(Arc::new(LoopbackSyncServer::new(Arc::new(server))))
}

/// Client configuration for `node` pointing at [`LOOPBACK_ENDPOINT`].
pub fn client_config(node: &TestNode) -> ReplicationClientConfig {
    ReplicationClientConfig::for_database(&node.db, LOOPBACK_ENDPOINT)
        .with_retry_interval(TEST_RETRY_INTERVAL)
}

/// Starts a replication client on `node` over `http`.
pub fn connect<C: HttpClient>(
    node: &TestNode,
    http: C,
    config: ReplicationClientConfig,
) -> ReplicationClient {
    let transport = HttpTransport::new(
        config.endpoint.clone(),
        http,
        config.local_node_id,
        config.local_node_auth.clone(),
    );
    ReplicationClient::start(config, Arc::clone(&node.events), transport)
}

/// Polls `check` until it holds or `timeout` elapses. Returns the last
/// result.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
