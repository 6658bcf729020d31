//! Serve command implementation.

use door_core::{DoorDatabase, NodeEventConfig, NodeEventManager};
use door_sync_engine::{HttpTransport, ReplicationClient, ReplicationClientConfig, ReqwestClient};
use door_sync_server::{ServerConfig, SyncServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Options of the serve command.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Listen address.
    pub bind: SocketAddr,
    /// Path of the database endpoint.
    pub base_path: String,
    /// Database endpoints of peers to replicate with.
    pub peers: Vec<String>,
    /// Register unknown nodes on first contact.
    pub auto_register: bool,
    /// Entities per batch.
    pub batch_size: usize,
    /// Periodic fetch interval.
    pub poll_interval: Option<Duration>,
}

impl ServeOptions {
    fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind)
            .with_base_path(&self.base_path)
            .with_auto_register_nodes(self.auto_register)
            .with_max_batch_size(self.batch_size)
    }

    fn client_config(&self, db: &DoorDatabase, peer: &str) -> ReplicationClientConfig {
        let config = ReplicationClientConfig::for_database(db, peer).with_batch_size(self.batch_size);
        match self.poll_interval {
            Some(interval) => config.with_poll_interval(interval),
            None => config,
        }
    }
}

/// Runs the serve command until Ctrl-C.
pub fn run(db: DoorDatabase, options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(db, options))
}

async fn serve(db: DoorDatabase, options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let events = NodeEventManager::start(db.clone(), NodeEventConfig::default())?;
    let server = Arc::new(SyncServer::new(options.server_config(), Arc::clone(&events)));

    let mut clients = Vec::with_capacity(options.peers.len());
    for peer in &options.peers {
        let config = options.client_config(&db, peer);
        let http = ReqwestClient::new(config.request_timeout)?;
        let transport = HttpTransport::new(
            peer.clone(),
            http,
            config.local_node_id,
            config.local_node_auth.clone(),
        );
        clients.push(ReplicationClient::start(config, Arc::clone(&events), transport));
    }

    let result = door_sync_server::run(server, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await;

    for client in &clients {
        client.close();
    }
    events.close();
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use door_core::{DoorDatabaseConfig, MetadataRegistry};

    #[test]
    fn builds_configs_from_options() {
        let db = DoorDatabase::open_in_memory(
            MetadataRegistry::new(),
            DoorDatabaseConfig::new().with_local_node_id(4),
        )
        .unwrap();
        let options = ServeOptions {
            bind: "127.0.0.1:0".parse().unwrap(),
            base_path: "db".into(),
            peers: vec!["http://hub/db".into()],
            auto_register: false,
            batch_size: 250,
            poll_interval: Some(Duration::from_secs(30)),
        };

        let server = options.server_config();
        assert_eq!(server.base_path, "/db");
        assert!(!server.auto_register_nodes);
        assert_eq!(server.max_batch_size, 250);

        let client = options.client_config(&db, "http://hub/db");
        assert_eq!(client.local_node_id, 4);
        assert_eq!(client.batch_size, 250);
        assert_eq!(client.poll_interval, Some(Duration::from_secs(30)));
    }
}
