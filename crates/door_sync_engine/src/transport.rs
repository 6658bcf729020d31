//! Transport layer abstraction for replication.

use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use door_sync_protocol::{
    endpoint_url, DoorMessage, ProtocolError, ReplicationReceivedAck, ACK_AND_GET_PENDING_PATH,
    HEADER_NODE_AUTH, HEADER_NODE_ID, HEADER_TIMESTAMP, MESSAGE_PATH, NODE_ID_PATH,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

/// Result of asking a peer for pending replications.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The peer sent the next batch.
    Message(DoorMessage),
    /// The peer has nothing pending for this node.
    Drained {
        /// Peer time (epoch millis) at which its queue was seen empty.
        timestamp: Option<i64>,
    },
}

/// The three calls a replication client makes to its peer.
///
/// This trait abstracts the network layer, allowing for HTTP or an
/// in-memory mock.
pub trait ReplicationTransport: Send + Sync + 'static {
    /// Asks the peer for its node id.
    fn get_node_id(&self) -> impl Future<Output = SyncResult<i64>> + Send;

    /// Delivers a message; the peer answers with the `orUid`s it applied.
    fn send_message(
        &self,
        message: &DoorMessage,
    ) -> impl Future<Output = SyncResult<ReplicationReceivedAck>> + Send;

    /// Acknowledges what was received and asks for the next batch.
    fn ack_and_get_pending(
        &self,
        ack: &ReplicationReceivedAck,
    ) -> impl Future<Output = SyncResult<FetchOutcome>> + Send;
}

impl<T: ReplicationTransport> ReplicationTransport for Arc<T> {
    fn get_node_id(&self) -> impl Future<Output = SyncResult<i64>> + Send {
        (**self).get_node_id()
    }

    fn send_message(
        &self,
        message: &DoorMessage,
    ) -> impl Future<Output = SyncResult<ReplicationReceivedAck>> + Send {
        (**self).send_message(message)
    }

    fn ack_and_get_pending(
        &self,
        ack: &ReplicationReceivedAck,
    ) -> impl Future<Output = SyncResult<FetchOutcome>> + Send {
        (**self).ack_and_get_pending(ack)
    }
}

/// HTTP-based replication transport.
///
/// Every request carries the local node id and secret in
/// [`HEADER_NODE_ID`] and [`HEADER_NODE_AUTH`].
pub struct HttpTransport<C: HttpClient> {
    endpoint: String,
    client: C,
    local_node_id: i64,
    local_node_auth: String,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the database endpoint `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        client: C,
        local_node_id: i64,
        local_node_auth: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            local_node_id,
            local_node_auth: local_node_auth.into(),
        }
    }

    /// Returns the database endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        request
            .with_header(HEADER_NODE_ID, self.local_node_id.to_string())
            .with_header(HEADER_NODE_AUTH, self.local_node_auth.as_str())
    }

    async fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let request = self.authorize(request);
        tracing::trace!(url = %request.url, "sending request");
        self.client
            .execute(request)
            .await
            .map_err(SyncError::transport_retryable)
    }
}

impl<C: HttpClient> ReplicationTransport for HttpTransport<C> {
    async fn get_node_id(&self) -> SyncResult<i64> {
        let url = endpoint_url(&self.endpoint, NODE_ID_PATH);
        let response = self.execute(HttpRequest::get(url)).await?;
        if response.status != 200 {
            return Err(SyncError::UnexpectedStatus {
                endpoint: NODE_ID_PATH,
                status: response.status,
            });
        }
        let value = response.header(HEADER_NODE_ID).ok_or(ProtocolError::InvalidHeader {
            name: HEADER_NODE_ID,
            reason: "missing".to_string(),
        })?;
        let node_id = value.trim().parse().map_err(|_| ProtocolError::InvalidHeader {
            name: HEADER_NODE_ID,
            reason: format!("not an integer: {value}"),
        })?;
        Ok(node_id)
    }

    async fn send_message(&self, message: &DoorMessage) -> SyncResult<ReplicationReceivedAck> {
        let url = endpoint_url(&self.endpoint, MESSAGE_PATH);
        let response = self
            .execute(HttpRequest::post_json(url, message.encode()?))
            .await?;
        if response.status != 200 {
            return Err(SyncError::UnexpectedStatus {
                endpoint: MESSAGE_PATH,
                status: response.status,
            });
        }
        Ok(ReplicationReceivedAck::decode(&response.body)?)
    }

    async fn ack_and_get_pending(&self, ack: &ReplicationReceivedAck) -> SyncResult<FetchOutcome> {
        let url = endpoint_url(&self.endpoint, ACK_AND_GET_PENDING_PATH);
        let response = self
            .execute(HttpRequest::post_json(url, ack.encode()?))
            .await?;
        match response.status {
            200 => Ok(FetchOutcome::Message(DoorMessage::decode(&response.body)?)),
            204 | 304 => Ok(FetchOutcome::Drained {
                timestamp: response
                    .header(HEADER_TIMESTAMP)
                    .and_then(|v| v.trim().parse().ok()),
            }),
            status => Err(SyncError::UnexpectedStatus {
                endpoint: ACK_AND_GET_PENDING_PATH,
                status,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    node_id: Option<i64>,
    handshake_failures: usize,
    lost_send_responses: usize,
    offline: bool,
    sent: Vec<DoorMessage>,
    acks: Vec<ReplicationReceivedAck>,
    pending: VecDeque<DoorMessage>,
}

/// A scripted transport for testing.
///
/// Sent messages are recorded and acknowledged in full. Fetches return the
/// queued messages in order, then [`FetchOutcome::Drained`].
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a mock peer with the given node id.
    pub fn new(node_id: i64) -> Self {
        Self {
            state: Mutex::new(MockState {
                node_id: Some(node_id),
                ..MockState::default()
            }),
        }
    }

    /// Makes the next `count` node id requests fail.
    pub fn fail_handshakes(&self, count: usize) {
        self.state.lock().handshake_failures = count;
    }

    /// Records the next `count` sent messages but fails the calls, as if the
    /// responses were lost.
    pub fn lose_send_responses(&self, count: usize) {
        self.state.lock().lost_send_responses = count;
    }

    /// Makes every request fail until set back.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Queues a message to return from the next fetch.
    pub fn push_pending(&self, message: DoorMessage) {
        self.state.lock().pending.push_back(message);
    }

    /// Returns every message sent so far.
    pub fn sent(&self) -> Vec<DoorMessage> {
        self.state.lock().sent.clone()
    }

    /// Returns every acknowledgment received with a fetch so far.
    pub fn acks(&self) -> Vec<ReplicationReceivedAck> {
        self.state.lock().acks.clone()
    }

    fn check_online(state: &MockState) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::transport_retryable("mock peer offline"));
        }
        Ok(())
    }
}

impl ReplicationTransport for MockTransport {
    async fn get_node_id(&self) -> SyncResult<i64> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if state.handshake_failures > 0 {
            state.handshake_failures -= 1;
            return Err(SyncError::transport_retryable("mock handshake failure"));
        }
        state.node_id.ok_or(SyncError::UnexpectedStatus {
            endpoint: NODE_ID_PATH,
            status: 404,
        })
    }

    async fn send_message(&self, message: &DoorMessage) -> SyncResult<ReplicationReceivedAck> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.sent.push(message.clone());
        if state.lost_send_responses > 0 {
            state.lost_send_responses -= 1;
            return Err(SyncError::transport_retryable("mock response lost"));
        }
        Ok(ReplicationReceivedAck::new(message.or_uids()))
    }

    async fn ack_and_get_pending(&self, ack: &ReplicationReceivedAck) -> SyncResult<FetchOutcome> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.acks.push(ack.clone());
        Ok(match state.pending.pop_front() {
            Some(message) => FetchOutcome::Message(message),
            None => FetchOutcome::Drained { timestamp: None },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{LoopbackClient, LoopbackServer};

    struct FixedServer {
        requests: Mutex<Vec<HttpRequest>>,
        response: HttpResponse,
    }

    impl LoopbackServer for FixedServer {
        async fn handle(&self, request: HttpRequest) -> HttpResponse {
            self.requests.lock().push(request);
            self.response.clone()
        }
    }

    fn loopback_transport(response: HttpResponse) -> HttpTransport<LoopbackClient<FixedServer>> {
        let server = Arc::new(FixedServer {
            requests: Mutex::new(Vec::new()),
            response,
        });
        HttpTransport::new("http://peer/db/", LoopbackClient::new(server), 5, "five")
    }

    #[tokio::test]
    async fn node_id_from_header() {
        let transport = loopback_transport(HttpResponse::status(200).with_header(HEADER_NODE_ID, "42"));
        assert_eq!(transport.get_node_id().await.unwrap(), 42);

        let requests = transport.client.server().requests.lock().clone();
        assert_eq!(requests[0].path(), "/db/replication/nodeId");
        assert_eq!(requests[0].header(HEADER_NODE_ID), Some("5"));
        assert_eq!(requests[0].header(HEADER_NODE_AUTH), Some("five"));
    }

    #[tokio::test]
    async fn missing_node_id_header_is_protocol_error() {
        let transport = loopback_transport(HttpResponse::status(200));
        let err = transport.get_node_id().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn node_id_requires_ok() {
        let transport = loopback_transport(HttpResponse::status(401).with_header(HEADER_NODE_ID, "42"));
        assert!(matches!(
            transport.get_node_id().await,
            Err(SyncError::UnexpectedStatus { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn drained_statuses() {
        let transport = loopback_transport(HttpResponse::status(204).with_header(HEADER_TIMESTAMP, "1700"));
        assert_eq!(
            transport.ack_and_get_pending(&ReplicationReceivedAck::default()).await.unwrap(),
            FetchOutcome::Drained { timestamp: Some(1700) }
        );

        let transport = loopback_transport(HttpResponse::status(304));
        assert_eq!(
            transport.ack_and_get_pending(&ReplicationReceivedAck::default()).await.unwrap(),
            FetchOutcome::Drained { timestamp: None }
        );
    }

    #[tokio::test]
    async fn fetch_decodes_message() {
        let message = DoorMessage::replication(9, 5, Vec::new());
        let transport = loopback_transport(HttpResponse::json(message.encode().unwrap()));
        assert_eq!(
            transport
                .ack_and_get_pending(&ReplicationReceivedAck::new(vec![1, 2]))
                .await
                .unwrap(),
            FetchOutcome::Message(message)
        );
        let body = transport.client.server().requests.lock()[0].body.clone();
        assert_eq!(ReplicationReceivedAck::decode(&body).unwrap().replication_uids, vec![1, 2]);
    }

    #[tokio::test]
    async fn offline_client_is_retryable_transport_error() {
        let transport = loopback_transport(HttpResponse::status(200));
        transport.client.set_online(false);
        let err = transport
            .send_message(&DoorMessage::replication(5, 9, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: true, .. }));
    }

    #[tokio::test]
    async fn mock_handshake_failures() {
        let mock = MockTransport::new(3);
        mock.fail_handshakes(2);
        assert!(mock.get_node_id().await.is_err());
        assert!(mock.get_node_id().await.is_err());
        assert_eq!(mock.get_node_id().await.unwrap(), 3);
    }
}
