//! Observable replication client state.

/// Snapshot of a [`crate::ReplicationClient`], published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    /// True once the handshake succeeded.
    pub initialized: bool,
    /// Node id of the peer, once known.
    pub remote_node_id: Option<i64>,
    /// Peer time (epoch millis) at which it last reported nothing pending
    /// for this node.
    pub last_receive_complete_time: Option<i64>,
    /// Messages delivered to the peer.
    pub batches_sent: u64,
    /// Entities delivered to the peer.
    pub entities_sent: u64,
    /// Messages fetched from the peer.
    pub batches_received: u64,
    /// Entities fetched from the peer.
    pub entities_received: u64,
    /// Failed round trips that were retried.
    pub retries: u64,
}

impl ClientState {
    /// Returns true if the peer has reported being drained at least once.
    pub fn has_drained(&self) -> bool {
        self.last_receive_complete_time.is_some()
    }
}
