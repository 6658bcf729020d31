//! Main sync server.

use crate::auth::NodeCredentials;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, PendingResponse, RequestHandler};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use door_core::NodeEventManager;
use door_storage::StorageBackend;
use door_sync_protocol::{
    DoorMessage, ReplicationReceivedAck, ACK_AND_GET_PENDING_PATH, HEADER_NODE_AUTH,
    HEADER_NODE_ID, HEADER_TIMESTAMP, MESSAGE_PATH, NODE_ID_PATH,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

const CONTENT_TYPE: &str = "content-type";
const JSON: &str = "application/json";

/// The replication endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// `GET nodeId`
    NodeId,
    /// `POST message`
    Message,
    /// `POST ackAndGetPendingReplications`
    AckAndGetPending,
}

impl Endpoint {
    /// Returns the endpoint for a path segment.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            NODE_ID_PATH => Some(Endpoint::NodeId),
            MESSAGE_PATH => Some(Endpoint::Message),
            ACK_AND_GET_PENDING_PATH => Some(Endpoint::AckAndGetPending),
            _ => None,
        }
    }

    /// Returns the path segment of the endpoint.
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::NodeId => NODE_ID_PATH,
            Endpoint::Message => MESSAGE_PATH,
            Endpoint::AckAndGetPending => ACK_AND_GET_PENDING_PATH,
        }
    }
}

/// A transport-independent view of an incoming request.
#[derive(Debug, Clone, Copy)]
pub struct ServerRequest<'a> {
    /// Request path, without query.
    pub path: &'a str,
    /// Value of the `door-node-id` header.
    pub node_id: Option<&'a str>,
    /// Value of the `door-node-auth` header.
    pub node_auth: Option<&'a str>,
    /// Request body.
    pub body: &'a [u8],
}

/// A transport-independent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(&'static str, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl ServerResponse {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![(CONTENT_TYPE, JSON.to_owned())],
            body,
        }
    }

    fn with_header(mut self, name: &'static str, value: impl ToString) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    /// Returns the value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl From<ServerError> for ServerResponse {
    fn from(err: ServerError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            tracing::warn!(status, error = %err, "replication request failed");
        } else {
            tracing::debug!(status, error = %err, "replication request rejected");
        }
        Self {
            status,
            headers: vec![(CONTENT_TYPE, "text/plain; charset=utf-8".to_owned())],
            body: err.to_string().into_bytes(),
        }
    }
}

impl IntoResponse for ServerResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.body).into_response();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

/// The sync server.
///
/// Serves the replication endpoints of one database. Requests are
/// authenticated against the node registry, incoming messages are applied
/// through the database's [`NodeEventManager`] and fetches are answered from
/// the outgoing replication queue of the calling node.
///
/// [`SyncServer::handle`] works on plain request parts so the server can be
/// driven without a socket; [`router`] and [`serve`] put it behind axum.
pub struct SyncServer<B: StorageBackend> {
    handler: RequestHandler<B>,
    context: Arc<HandlerContext<B>>,
}

impl<B: StorageBackend> SyncServer<B> {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig, events: Arc<NodeEventManager<B>>) -> Self {
        let context = Arc::new(HandlerContext::new(config, events));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the event manager of the served database.
    pub fn events(&self) -> &Arc<NodeEventManager<B>> {
        &self.context.events
    }

    /// Resolves a request path to an endpoint.
    pub fn endpoint_for_path(&self, path: &str) -> Option<Endpoint> {
        let rest = path.strip_prefix(self.config().base_path.as_str())?;
        let name = rest
            .strip_prefix('/')?
            .strip_prefix(door_sync_protocol::REPLICATION_PATH)?
            .strip_prefix('/')?;
        Endpoint::from_name(name)
    }

    /// Handles one request.
    pub async fn handle(&self, request: ServerRequest<'_>) -> ServerResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => err.into(),
        }
    }

    async fn dispatch(&self, request: ServerRequest<'_>) -> ServerResult<ServerResponse> {
        let endpoint = self
            .endpoint_for_path(request.path)
            .ok_or_else(|| ServerError::NotFound(request.path.to_owned()))?;
        let credentials = NodeCredentials::from_headers(request.node_id, request.node_auth)?;
        self.handler.authenticate(&credentials).await?;
        let caller = credentials.node_id;

        match endpoint {
            Endpoint::NodeId => Ok(ServerResponse::new(200)
                .with_header(HEADER_NODE_ID, self.handler.handle_node_id())),
            Endpoint::Message => {
                let message = DoorMessage::decode(request.body)?;
                let ack = self.handler.handle_message(caller, message).await?;
                Ok(ServerResponse::json(ack.encode()?))
            }
            Endpoint::AckAndGetPending => {
                let ack = if request.body.is_empty() {
                    ReplicationReceivedAck::default()
                } else {
                    ReplicationReceivedAck::decode(request.body)?
                };
                match self.handler.handle_ack_and_get_pending(caller, ack).await? {
                    PendingResponse::Batch(message) => Ok(ServerResponse::json(message.encode()?)),
                    PendingResponse::Drained { timestamp } => {
                        Ok(ServerResponse::new(204).with_header(HEADER_TIMESTAMP, timestamp))
                    }
                }
            }
        }
    }
}

/// Builds the axum router for a server.
pub fn router<B: StorageBackend>(server: Arc<SyncServer<B>>) -> Router {
    let config = server.config().clone();
    Router::new()
        .route(
            &config.endpoint_path(NODE_ID_PATH),
            get(replication_endpoint::<B>),
        )
        .route(
            &config.endpoint_path(MESSAGE_PATH),
            post(replication_endpoint::<B>),
        )
        .route(
            &config.endpoint_path(ACK_AND_GET_PENDING_PATH),
            post(replication_endpoint::<B>),
        )
        .with_state(server)
}

async fn replication_endpoint<B: StorageBackend>(
    State(server): State<Arc<SyncServer<B>>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let request = ServerRequest {
        path: uri.path(),
        node_id: header(HEADER_NODE_ID),
        node_auth: header(HEADER_NODE_AUTH),
        body: &body,
    };
    server.handle(request).await.into_response()
}

/// Serves `server` on `listener` until `shutdown` resolves.
pub async fn serve<B, F>(
    server: Arc<SyncServer<B>>,
    listener: TcpListener,
    shutdown: F,
) -> ServerResult<()>
where
    B: StorageBackend,
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        base_path = %server.config().base_path,
        local_node_id = server.handler.handle_node_id(),
        "sync server listening"
    );
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!(%addr, "sync server stopped");
    Ok(())
}

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn run<B, F>(server: Arc<SyncServer<B>>, shutdown: F) -> ServerResult<()>
where
    B: StorageBackend,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(server.config().bind_addr).await?;
    serve(server, listener, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_core::{
        ChangeType, DoorDatabase, DoorDatabaseConfig, EntityField, FieldType, MetadataRegistry,
        NodeEventConfig, ReplicationEntityMetaData,
    };
    use door_storage::{SqliteBackend, Value};
    use door_sync_protocol::DoorReplicationEntity;
    use serde_json::json;

    const TABLE: i32 = 1;
    const SERVER: i64 = 1;
    const CLIENT: i64 = 2;

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
        DoorDatabase::open_in_memory(registry, DoorDatabaseConfig::new().with_local_node_id(SERVER))
            .unwrap()
    }

    fn server(db: &DoorDatabase<SqliteBackend>) -> SyncServer<SqliteBackend> {
        let events = NodeEventManager::start(db.clone(), NodeEventConfig::default()).unwrap();
        SyncServer::new(ServerConfig::default().with_base_path("/db"), events)
    }

    fn request<'a>(path: &'a str, body: &'a [u8]) -> ServerRequest<'a> {
        ServerRequest {
            path,
            node_id: Some("2"),
            node_auth: Some("client-secret"),
            body,
        }
    }

    fn item(or_uid: i64, uid: i64, version: i64) -> DoorReplicationEntity {
        DoorReplicationEntity {
            table_id: TABLE,
            or_uid,
            entity: json!({ "itemUid": uid, "itemVersion": version }),
        }
    }

    #[tokio::test]
    async fn resolves_endpoint_paths() {
        let server = server(&open());

        assert_eq!(
            server.endpoint_for_path("/db/replication/nodeId"),
            Some(Endpoint::NodeId)
        );
        assert_eq!(
            server.endpoint_for_path("/db/replication/ackAndGetPendingReplications"),
            Some(Endpoint::AckAndGetPending)
        );
        assert_eq!(server.endpoint_for_path("/replication/nodeId"), None);
        assert_eq!(server.endpoint_for_path("/db/replication/other"), None);
        assert_eq!(Endpoint::from_name(Endpoint::Message.name()), Some(Endpoint::Message));
    }

    #[tokio::test]
    async fn node_id_registers_caller() {
        let db = open();
        let server = server(&db);

        let response = server.handle(request("/db/replication/nodeId", b"")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.header(HEADER_NODE_ID), Some("1"));
        assert_eq!(db.find_node(CLIENT).unwrap().unwrap().auth, "client-secret");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let db = open();
        let server = server(&db);

        let mut anonymous = request("/db/replication/nodeId", b"");
        anonymous.node_auth = None;
        assert_eq!(server.handle(anonymous).await.status, 401);

        assert_eq!(server.handle(request("/db/replication/x", b"")).await.status, 404);
        assert_eq!(
            server.handle(request("/db/replication/message", b"{")).await.status,
            400
        );

        let unknown = DoorMessage::replication(
            CLIENT,
            SERVER,
            vec![DoorReplicationEntity {
                table_id: 99,
                or_uid: 1,
                entity: json!({}),
            }],
        )
        .encode()
        .unwrap();
        assert_eq!(
            server.handle(request("/db/replication/message", &unknown)).await.status,
            422
        );

        let misaddressed = DoorMessage::replication(CLIENT, 5, vec![item(1, 7, 1)])
            .encode()
            .unwrap();
        assert_eq!(
            server.handle(request("/db/replication/message", &misaddressed)).await.status,
            400
        );
    }

    #[tokio::test]
    async fn message_is_applied_and_acknowledged() {
        let db = open();
        let server = server(&db);

        let body = DoorMessage::replication(CLIENT, SERVER, vec![item(10, 7, 3), item(11, 8, 1)])
            .encode()
            .unwrap();
        let response = server.handle(request("/db/replication/message", &body)).await;
        assert_eq!(response.status, 200);
        let ack = ReplicationReceivedAck::decode(&response.body).unwrap();
        assert_eq!(ack.replication_uids, vec![10, 11]);

        let version: Option<i64> = db
            .read(|conn| {
                Ok(conn
                    .prepare("SELECT itemVersion FROM Item WHERE itemUid = 7")?
                    .query(&[])?
                    .next()
                    .and_then(|row| row.get_index(0).and_then(Value::as_i64)))
            })
            .unwrap();
        assert_eq!(version, Some(3));

        // Nothing is echoed back to the sender.
        let response = server
            .handle(request("/db/replication/ackAndGetPendingReplications", b""))
            .await;
        assert_eq!(response.status, 204);
        let timestamp: i64 = response.header(HEADER_TIMESTAMP).unwrap().parse().unwrap();
        assert!(timestamp > 0);
    }

    #[tokio::test]
    async fn pending_batches_until_acknowledged() {
        let db = open();
        let server = server(&db);
        assert_eq!(server.handle(request("/db/replication/nodeId", b"")).await.status, 200);

        db.write(|tx| {
            tx.execute(
                "INSERT INTO Item (itemUid, itemVersion) VALUES (?, ?)",
                &[Value::Integer(7), Value::Integer(1)],
            )?;
            tx.record_change(TABLE, 7, 0, ChangeType::Insert)
        })
        .unwrap();

        let path = "/db/replication/ackAndGetPendingReplications";
        let first = server.handle(request(path, b"")).await;
        assert_eq!(first.status, 200);
        let message = DoorMessage::decode(&first.body).unwrap();
        assert_eq!(message.from_node, SERVER);
        assert_eq!(message.to_node, CLIENT);
        assert_eq!(message.replications[0].entity["itemUid"], 7);

        // Unacknowledged rows are sent again.
        let again = DoorMessage::decode(&server.handle(request(path, b"")).await.body).unwrap();
        assert_eq!(again.or_uids(), message.or_uids());

        let ack = ReplicationReceivedAck::new(message.or_uids()).encode().unwrap();
        assert_eq!(server.handle(request(path, &ack)).await.status, 204);
    }
}
