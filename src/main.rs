//! ferry - shard relocation for a replicated point store.
//!
//! Start a cluster with a metadata holder and two joiners:
//!
//! ```text
//! ferry serve --peer-id 1 --uri 127.0.0.1:6335
//! ferry serve --peer-id 2 --uri 127.0.0.1:6336 --bootstrap 127.0.0.1:6335
//! ferry serve --peer-id 3 --uri 127.0.0.1:6337 --bootstrap 127.0.0.1:6335
//! ```
//!
//! and drive it with JSON control commands:
//!
//! ```text
//! ferry control --peer 127.0.0.1:6336 \
//!   '{"command":"update_cluster","collection":"benchmark",
//!     "operation":{"move_shard":{"shard_id":3,"from_peer_id":1,"to_peer_id":2}}}'
//! ```

use clap::{Args, Parser, Subcommand};
use ferry::network::{Message, PeerClient, TransportConfig};
use ferry::{Node, NodeConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Shard relocation for a replicated point store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Serve(ServeArgs),
    /// Send a JSON control command to a running node
    Control {
        /// Address of any peer in the cluster
        #[arg(long, default_value = "127.0.0.1:6335")]
        peer: String,
        /// Command body, e.g. {"command":"cluster_info","collection":"benchmark"}
        body: String,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Peer id; random when omitted
    #[arg(long, env = "FERRY_PEER_ID")]
    peer_id: Option<u64>,

    /// Address this peer listens on and advertises
    #[arg(long, env = "FERRY_URI")]
    uri: Option<String>,

    /// Peer to join; omit to start a new cluster
    #[arg(long, env = "FERRY_BOOTSTRAP")]
    bootstrap: Option<String>,

    /// Directory for node metadata
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// Health check interval in milliseconds
    #[arg(long)]
    health_check_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferry=info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Control { peer, body } => {
            let client = PeerClient::new(peer, TransportConfig::default());
            match client.request(&Message::Control(body)).await? {
                Message::ControlReply(reply) => println!("{}", reply),
                other => return Err(format!("unexpected reply: {}", other.name()).into()),
            }
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::from_env()?;
    if let Some(peer_id) = args.peer_id {
        config.peer_id = peer_id;
    }
    if let Some(uri) = &args.uri {
        config = config.with_uri(uri)?;
    }
    if let Some(bootstrap) = args.bootstrap {
        config = config.with_bootstrap(bootstrap);
    }
    if let Some(path) = args.storage_path {
        config = config.with_storage_path(path);
    }
    if let Some(ms) = args.health_check_ms {
        config = config.with_health_check_interval(Duration::from_millis(ms));
    }

    let node = Node::start(config).await?;
    info!(
        peer_id = node.peer_id(),
        addr = node.addr(),
        "Serving; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
