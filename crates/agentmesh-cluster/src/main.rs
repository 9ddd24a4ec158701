#![warn(missing_docs)]

//! `amesh-node`: runs one management node in single-node mode with
//! in-memory records and simulated hosts.

use std::path::PathBuf;
use std::sync::Arc;

use agentmesh_cluster::{
    build_transport, ClusterAgentManager, ClusterBasedPlanner, ClusterConfig, ClusterServices, HostRecord,
    LocalLockService, LoopbackCluster, MemoryNodeDirectory, MemoryRecordStore, NodeRecord, SimulatedHostLoader,
    SystemClock, UnhandledDispatch,
};
use agentmesh_transport::HostId;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "amesh-node")]
#[command(about = "agentmesh management node", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, default_value = "/etc/agentmesh/node.toml")]
    config: PathBuf,

    /// Overrides the configured node id.
    #[arg(long, env = "AMESH_NODE_ID")]
    node_id: Option<u64>,

    /// Number of simulated hosts to register at startup.
    #[arg(long, default_value = "0")]
    simulated_hosts: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        ClusterConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        ClusterConfig::default()
    };
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    config.validate()?;
    tracing::info!(node_id = config.node_id, listen = %config.listen_addr, "agentmesh node starting");

    let clock = Arc::new(SystemClock);
    let records = Arc::new(MemoryRecordStore::new(clock.clone()));
    for id in 1..=cli.simulated_hosts {
        records.put_host(HostRecord::new(HostId::new(id), format!("sim-{}", id), Some(id % 4)));
    }
    let nodes = Arc::new(MemoryNodeDirectory::new());
    nodes.upsert(NodeRecord::up(config.node(), config.listen_addr.clone()));
    let hub = LoopbackCluster::new();

    let transport = build_transport(&config)?;
    let listener = transport.listen(&config.listen_addr).await?;
    let services = ClusterServices {
        records: records.clone(),
        nodes,
        lock: Arc::new(LocalLockService::new()),
        loader: Arc::new(SimulatedHostLoader::new()),
        rpc: hub.endpoint(config.node(), records.clone()),
        generic: Arc::new(UnhandledDispatch),
        planners: vec![Arc::new(ClusterBasedPlanner::new(records))],
        clock,
    };
    let manager = ClusterAgentManager::new(config.clone(), transport, services)?;
    hub.register(config.node(), manager.command_handler());

    manager.start();
    let server = tokio::spawn(manager.clone().serve(listener));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    manager.stop().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("link server error: {}", e),
        Err(e) => tracing::error!("link server task failed: {}", e),
    }
    Ok(())
}
