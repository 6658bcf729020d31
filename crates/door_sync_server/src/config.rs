//! Server configuration.

use std::net::SocketAddr;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Path of the database endpoint (e.g. `/db`); the replication endpoints
    /// live under `<base_path>/replication/`. Empty for the root.
    pub base_path: String,
    /// Whether unknown nodes are registered on first contact.
    pub auto_register_nodes: bool,
    /// Maximum number of entities returned per fetch.
    pub max_batch_size: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            base_path: String::new(),
            auto_register_nodes: true,
            max_batch_size: 1000,
        }
    }

    /// Sets the base path. Leading and trailing slashes are normalized.
    pub fn with_base_path(mut self, path: impl AsRef<str>) -> Self {
        let trimmed = path.as_ref().trim_matches('/');
        self.base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        self
    }

    /// Enables or disables registration of unknown nodes.
    pub fn with_auto_register_nodes(mut self, enabled: bool) -> Self {
        self.auto_register_nodes = enabled;
        self
    }

    /// Sets the maximum fetch batch size. Values below 1 are raised to 1.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Returns the full path of a replication endpoint.
    pub fn endpoint_path(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_path,
            door_sync_protocol::REPLICATION_PATH,
            name
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8087)))
    }
}
