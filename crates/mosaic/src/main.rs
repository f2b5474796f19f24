//! Command-line launcher for the mosaic coordinator and cache nodes.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use mo_index::{IndexConfig, IndexServer};
use mo_node::{synthetic::SyntheticProducer, NodeConfig, NodeServer};
use mo_types::CacheType;

#[derive(Parser)]
#[command(name = "mosaic", version, about = "Distributed geo result cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator (index) process.
    Index(IndexArgs),
    /// Run a cache node with the built-in synthetic producer.
    Node(NodeArgs),
}

#[derive(clap::Args)]
struct IndexArgs {
    /// Port to listen on (0 picks an ephemeral port).
    #[arg(long, default_value_t = 10400)]
    port: u16,

    /// Reorg strategy: capacity, geo or graph.
    #[arg(long, default_value = "capacity")]
    strategy: String,

    /// Relevance function: lru or costlru.
    #[arg(long, default_value = "costlru")]
    relevance: String,

    /// Disable merging of compatible pending create jobs.
    #[arg(long)]
    no_batching: bool,

    /// Reorg tick in milliseconds.
    #[arg(long, default_value_t = 500)]
    reorg_interval_ms: u64,

    /// Stats collection tick in milliseconds.
    #[arg(long, default_value_t = 2500)]
    stats_interval_ms: u64,

    /// Per-node target usage during reorg (0..1].
    #[arg(long, default_value_t = 0.8)]
    target_usage: f64,
}

#[derive(clap::Args)]
struct NodeArgs {
    /// Coordinator host.
    #[arg(long, default_value = "127.0.0.1")]
    index_host: String,

    /// Coordinator port.
    #[arg(long, default_value_t = 10400)]
    index_port: u16,

    /// Delivery service port (0 picks an ephemeral port).
    #[arg(long, default_value_t = 0)]
    delivery_port: u16,

    /// Worker threads pulling jobs from the coordinator.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Byte budget per cache type, in megabytes.
    #[arg(long, default_value_t = 64)]
    capacity_mb: u64,

    /// Widening factor for resolution validity (1.0 = exact scale only).
    #[arg(long, default_value_t = 1.0)]
    resolution_tolerance: f64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Index(args) => run_index(args),
        Command::Node(args) => run_node(args),
    }
}

fn run_index(args: IndexArgs) -> anyhow::Result<()> {
    let config = IndexConfig {
        port: args.port,
        strategy: args.strategy,
        relevance: args.relevance,
        batching: !args.no_batching,
        reorg_interval: Duration::from_millis(args.reorg_interval_ms),
        stats_interval: Duration::from_millis(args.stats_interval_ms),
        target_usage: args.target_usage,
        ..IndexConfig::default()
    };
    let server = IndexServer::bind(config)?;
    log::info!("coordinator ready on {}", server.local_addr());
    server.run()?;
    Ok(())
}

fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let config = NodeConfig {
        index_host: args.index_host,
        index_port: args.index_port,
        delivery_port: args.delivery_port,
        workers: args.workers,
        capacities: CacheType::ALL
            .iter()
            .map(|t| (*t, args.capacity_mb * 1024 * 1024))
            .collect(),
        resolution_tolerance: args.resolution_tolerance,
        ..NodeConfig::default()
    };
    let server = NodeServer::new(config, Arc::new(SyntheticProducer::new()))?;
    log::info!("node ready, delivery on port {}", server.delivery_port());
    server.run()?;
    Ok(())
}
