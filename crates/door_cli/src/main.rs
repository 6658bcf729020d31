//! Door CLI
//!
//! Runs a replicating node and inspects its bookkeeping.
//!
//! # Commands
//!
//! - `serve` - Serve the replication endpoints and replicate with peers
//! - `nodes list` / `nodes add` - Inspect or extend the node registry
//! - `pending` - Show the outgoing queue depth per destination

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Door replicating database node.
#[derive(Parser)]
#[command(name = "door")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// JSON file describing the replicated entities
    #[arg(global = true, short, long)]
    schema: Option<PathBuf>,

    /// Local node id, used when the database is created
    #[arg(global = true, long)]
    node_id: Option<i64>,

    /// Local node secret, used when the database is created
    #[arg(global = true, long)]
    node_auth: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the replication endpoints and replicate with peers
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8087")]
        bind: SocketAddr,

        /// Path of the database endpoint, e.g. /db
        #[arg(long, default_value = "")]
        base_path: String,

        /// Database endpoint of a peer to replicate with (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Reject nodes that are not registered yet
        #[arg(long)]
        no_auto_register: bool,

        /// Entities per batch, sent and served
        #[arg(long, default_value_t = door_sync_engine::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Ask peers for pending data every N seconds
        #[arg(long)]
        poll_secs: Option<u64>,
    },

    /// Inspect or extend the node registry
    Nodes {
        #[command(subcommand)]
        command: NodesCommand,
    },

    /// Show the outgoing queue depth per destination
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum NodesCommand {
    /// List known nodes
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Register a node
    Add {
        /// Node id
        id: i64,

        /// Shared secret the node presents
        auth: String,

        /// Database endpoint of the node
        #[arg(long)]
        endpoint: Option<String>,

        /// Queue every stored entity for the new node
        #[arg(long)]
        backfill: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = cli.path.ok_or("Database path required")?;
    let db = commands::open_database(
        &path,
        cli.schema.as_deref(),
        cli.node_id,
        cli.node_auth.as_deref(),
    )?;

    match cli.command {
        Commands::Serve {
            bind,
            base_path,
            peers,
            no_auto_register,
            batch_size,
            poll_secs,
        } => {
            let options = commands::serve::ServeOptions {
                bind,
                base_path,
                peers,
                auto_register: !no_auto_register,
                batch_size,
                poll_interval: poll_secs.map(std::time::Duration::from_secs),
            };
            commands::serve::run(db, options)?;
        }
        Commands::Nodes {
            command: NodesCommand::List { format },
        } => {
            commands::nodes::list(&db, &format, &mut std::io::stdout())?;
        }
        Commands::Nodes {
            command:
                NodesCommand::Add {
                    id,
                    auth,
                    endpoint,
                    backfill,
                },
        } => {
            commands::nodes::add(&db, id, &auth, endpoint, backfill)?;
        }
        Commands::Pending { format } => {
            commands::pending::run(&db, &format, &mut std::io::stdout())?;
        }
    }

    Ok(())
}
