//! Database and node event configuration.

/// Configuration for opening a [`crate::DoorDatabase`].
#[derive(Debug, Clone)]
pub struct DoorDatabaseConfig {
    /// Fixed local node id. When `None`, the id stored in the database is
    /// used, or a random one is generated and stored on first open.
    pub local_node_id: Option<i64>,

    /// Fixed local node secret. Generated and stored when `None`.
    pub local_node_auth: Option<String>,

    /// Whether to create entity tables, receive views and receive triggers
    /// from the registered metadata.
    pub create_entity_tables: bool,
}

impl Default for DoorDatabaseConfig {
    fn default() -> Self {
        Self {
            local_node_id: None,
            local_node_auth: None,
            create_entity_tables: true,
        }
    }
}

impl DoorDatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local node id.
    #[must_use]
    pub fn with_local_node_id(mut self, node_id: i64) -> Self {
        self.local_node_id = Some(node_id);
        self
    }

    /// Sets the local node secret.
    #[must_use]
    pub fn with_local_node_auth(mut self, auth: impl Into<String>) -> Self {
        self.local_node_auth = Some(auth.into());
        self
    }

    /// Sets whether entity tables are created on open.
    #[must_use]
    pub fn with_create_entity_tables(mut self, create: bool) -> Self {
        self.create_entity_tables = create;
        self
    }
}

/// Configuration for a [`crate::NodeEventManager`].
#[derive(Debug, Clone)]
pub struct NodeEventConfig {
    /// Capacity of each broadcast channel. Slow subscribers that fall further
    /// behind than this see a lag notification instead of old events.
    pub channel_capacity: usize,

    /// Maximum outgoing queue rows read per watcher query.
    pub watch_batch_size: usize,
}

impl Default for NodeEventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            watch_batch_size: 1000,
        }
    }
}

impl NodeEventConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the broadcast channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Sets the watcher query batch size.
    #[must_use]
    pub fn with_watch_batch_size(mut self, size: usize) -> Self {
        self.watch_batch_size = size.max(1);
        self
    }
}
