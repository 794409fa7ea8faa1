//! HarborKV Server Binary
//!
//! Starts one HarborKV node.

use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use harborkv::cluster::{Node, NodeId};
use harborkv::config::{ConflictPolicy, ReplicationMode, Topology};
use harborkv::Config;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    Standalone,
    PrimarySecondary,
    Masterless,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReplicationArg {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictArg {
    Lww,
    Surface,
}

/// HarborKV Server
#[derive(Parser, Debug)]
#[command(name = "harborkv-server")]
#[command(about = "Crash-safe replicated key-value store")]
#[command(version)]
struct Args {
    /// Identifier of this node, unique in the cluster
    #[arg(long, default_value = "1")]
    node_id: NodeId,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    listen: String,

    /// Peer node as ID=HOST:PORT (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    #[arg(long, value_enum, default_value = "standalone")]
    topology: TopologyArg,

    /// When writes are acknowledged
    #[arg(long, value_enum, default_value = "sync")]
    replication: ReplicationArg,

    /// Write quorum (masterless)
    #[arg(short = 'w', long, default_value = "2")]
    write_quorum: usize,

    /// Read quorum (masterless)
    #[arg(short = 'r', long, default_value = "2")]
    read_quorum: usize,

    /// Handling of concurrent versions on read (masterless)
    #[arg(long, value_enum, default_value = "lww")]
    conflict: ConflictArg,

    /// Data directory
    #[arg(short, long, default_value = "./harborkv_data")]
    data_dir: PathBuf,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,
}

fn parse_peer(s: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got '{}'", s))?;
    let id = id
        .parse()
        .map_err(|e| format!("bad node id '{}': {}", id, e))?;
    Ok((id, addr.to_string()))
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,harborkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("HarborKV Server v{}", harborkv::VERSION);
    tracing::info!("Node id: {}", args.node_id);
    tracing::info!("Data directory: {}", args.data_dir.display());
    tracing::info!("Listen address: {}", args.listen);

    let replication = match args.replication {
        ReplicationArg::Sync => ReplicationMode::Synchronous,
        ReplicationArg::Async => ReplicationMode::Asynchronous,
    };
    let topology = match args.topology {
        TopologyArg::Standalone => Topology::Standalone,
        TopologyArg::PrimarySecondary => Topology::PrimarySecondary { replication },
        TopologyArg::Masterless => Topology::Masterless {
            write_quorum: args.write_quorum,
            read_quorum: args.read_quorum,
            write_mode: replication,
            conflict_policy: match args.conflict {
                ConflictArg::Lww => ConflictPolicy::LastWriterWins,
                ConflictArg::Surface => ConflictPolicy::Surface,
            },
        },
    };

    // Build config from args
    let mut builder = Config::builder()
        .node_id(args.node_id)
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .topology(topology);
    for (id, addr) in args.peers {
        builder = builder.peer(id, addr);
    }
    let config = builder.build();

    let node = match Node::start(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = node.run() {
        tracing::error!("Server error: {}", e);
        process::exit(1);
    }

    tracing::info!("Server stopped");
}
