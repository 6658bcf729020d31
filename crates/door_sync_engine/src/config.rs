//! Configuration for replication clients.

use door_core::DoorDatabase;
use door_storage::StorageBackend;
use std::time::Duration;

/// Default number of entities per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Configuration for one [`crate::ReplicationClient`].
#[derive(Debug, Clone)]
pub struct ReplicationClientConfig {
    /// Id of the local node, sent with every request.
    pub local_node_id: i64,
    /// Secret of the local node, sent with every request.
    pub local_node_auth: String,
    /// Database endpoint of the peer (e.g. `https://server/db/`).
    pub endpoint: String,
    /// Maximum number of entities per message.
    pub batch_size: usize,
    /// Delay before a failed round trip is retried.
    pub retry_interval: Duration,
    /// When set, asks the peer for pending data at this interval even
    /// without a local event.
    pub poll_interval: Option<Duration>,
    /// Timeout applied by HTTP clients built from this config.
    pub request_timeout: Duration,
}

impl ReplicationClientConfig {
    /// Creates a configuration with default intervals and batch size.
    pub fn new(local_node_id: i64, local_node_auth: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            local_node_id,
            local_node_auth: local_node_auth.into(),
            endpoint: endpoint.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            retry_interval: Duration::from_secs(10),
            poll_interval: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Creates a configuration using the identity of `db`.
    pub fn for_database<B: StorageBackend>(db: &DoorDatabase<B>, endpoint: impl Into<String>) -> Self {
        Self::new(db.local_node_id(), db.local_node_auth(), endpoint)
    }

    /// Sets the batch size. Values below 1 are raised to 1.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Enables periodic polling of the peer.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplicationClientConfig::new(1, "secret", "http://server/db/");
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert_eq!(config.poll_interval, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn builder() {
        let config = ReplicationClientConfig::new(1, "secret", "http://server/db/")
            .with_batch_size(0)
            .with_retry_interval(Duration::from_millis(50))
            .with_poll_interval(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(3));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
        assert_eq!(config.poll_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
    }
}
