//! Shared helpers for the multi-node scenarios under `tests/`.

use std::time::Duration;

use chronicle_clock::ClockMode;
use chronicle_node::{ClusterConfig, LatencyRange, Node, SigningMode};
use chronicle_types::{Block, BlockHash};

/// A cluster that decides a block every 300 ms.
pub fn fast_cluster(seeds: usize, peers: usize, base_port: u16) -> ClusterConfig {
    chronicle_logging::try_init_for_tests();
    ClusterConfig {
        seeds,
        peers,
        tick_ms: 150,
        clock_mode: ClockMode::DriftCorrected,
        signing: SigningMode::Ed25519,
        send_latency_ms: LatencyRange::new(5, 15),
        startup_timeout_ticks: 2,
        base_port,
        ..ClusterConfig::default()
    }
}

/// Poll `check` every 20 ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// The hash each node holds at `height`, `None` where it has no block.
pub fn hashes_at(nodes: &[Node], height: u64) -> Vec<Option<BlockHash>> {
    nodes.iter().map(|n| block_at(n, height).map(|b| b.hash)).collect()
}

pub fn block_at(node: &Node, height: u64) -> Option<Block> {
    node.context().ledger.get_block_by_index(height as i64).ok()
}

/// Lowest tip across `nodes`.
pub fn min_tip(nodes: &[Node]) -> u64 {
    nodes.iter().map(|n| n.status().tip_height).min().unwrap_or(0)
}
