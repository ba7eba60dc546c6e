//! Chronicle node binary
//!
//! `CHRONICLE_MODE=node` runs one node over UDP with settings from the
//! `CHRONICLE_*` environment. Any other mode runs an in-process cluster for
//! a fixed number of rounds and logs every node's status each round.

use std::sync::Arc;
use std::time::Duration;

use chronicle_node::{ClusterConfig, LocalCluster, Node, NodeConfig};
use chronicle_protocols::UdpTransport;
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    chronicle_logging::init(chronicle_logging::DEFAULT_DIRECTIVES);

    match std::env::var("CHRONICLE_MODE").as_deref() {
        Ok("node") => run_node().await,
        _ => run_cluster().await,
    }
}

async fn run_node() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("CHRONICLE_CONFIG") {
        Ok(path) => NodeConfig::from_json_file(path)?,
        Err(_) => NodeConfig::from_env()?,
    };
    let signer = config.signer()?;
    tracing::info!(id = %signer.id(), duty = %config.duty, addr = %config.listen_addr, "Starting node");

    let transport = Arc::new(UdpTransport::bind(config.listen_addr).await?);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
    let (stop_tx, stop_rx) = watch::channel(false);
    let receiver = transport.spawn_receiver(inbound_tx, stop_rx);

    let node = Node::init(config, signer, transport, inbound_rx).await?;
    let mut stopped = node.context().subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = stopped.wait_for(|s| *s) => tracing::warn!("Node stopped itself"),
    }

    let outcome = node.close().await;
    stop_tx.send_replace(true);
    let _ = receiver.await;
    outcome?;
    Ok(())
}

async fn run_cluster() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::from_env()?;
    let rounds = config.rounds;
    let cycle = Duration::from_millis(config.tick_ms * 2);
    tracing::info!(seeds = config.seeds, peers = config.peers, rounds, "Starting local cluster");

    let cluster = LocalCluster::start(config).await?;
    let mut interval = tokio::time::interval(cycle);
    interval.tick().await;
    for round in 1..=rounds {
        interval.tick().await;
        for node in cluster.nodes() {
            tracing::info!(round, "{}", node.status());
        }
        if cluster.nodes().iter().any(Node::is_stopped) {
            tracing::warn!(round, "A node stopped; ending the run");
            break;
        }
    }

    cluster.close().await?;
    Ok(())
}
