//! In-process clusters over a shared [`LocalNetwork`].

use std::sync::Arc;
use std::time::Duration;

use chronicle_protocols::{LocalNetwork, Signer, Transport};
use chronicle_types::Duty;
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{ClusterConfig, NeighborConfig, Node, NodeConfig, NodeError, Result};

/// Several nodes wired to one in-process network.
pub struct LocalCluster {
    network: Arc<LocalNetwork>,
    nodes: Vec<Node>,
}

struct Member {
    config: NodeConfig,
    signer: Arc<dyn Signer>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl LocalCluster {
    /// Boot the first seed, then everyone else concurrently.
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let network = LocalNetwork::new(1024);

        let mut members = Vec::with_capacity(config.seeds + config.peers);
        for i in 0..config.seeds + config.peers {
            let duty = if i < config.seeds { Duty::Seed } else { Duty::Peer };
            let port = config
                .base_port
                .checked_add(i as u16)
                .ok_or_else(|| NodeError::Startup("cluster port range overflows".into()))?;
            let node_config = config.node_template(duty, port);
            let signer = node_config.signer()?;
            // Every inbox exists before anyone sends.
            let inbound = network.register(node_config.listen_addr);
            members.push(Member {
                config: node_config,
                signer,
                inbound,
            });
        }

        let seeds: Vec<NeighborConfig> = members[..config.seeds]
            .iter()
            .map(|m| NeighborConfig::new(m.signer.id(), m.config.listen_addr))
            .collect();
        let mut members = members.into_iter();

        // The first seed knows no other seed and creates the genesis block.
        let Some(first) = members.next() else {
            return Err(NodeError::Startup("cluster has no members".into()));
        };
        let first = boot(&network, first).await?;

        let rest = members.map(|mut member| {
            let addr = member.config.listen_addr;
            member.config.seeds = seeds.iter().filter(|s| s.addr != addr).cloned().collect();
            boot(&network, member)
        });
        let mut nodes = vec![first];
        nodes.extend(try_join_all(rest).await?);

        info!(
            seeds = config.seeds,
            peers = config.peers,
            tick_ms = config.tick_ms,
            "Local cluster running"
        );
        Ok(Self { network, nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Wait until every node's tip reaches `height`.
    ///
    /// Returns false on timeout.
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let poll = async {
            loop {
                if self.nodes.iter().all(|n| n.status().tip_height >= height) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Stop every node. Reports the first fatal error.
    pub async fn close(self) -> Result<()> {
        let mut first_error = None;
        for node in &self.nodes {
            if let Err(e) = node.close().await {
                warn!(node = %node.id(), error = %e, "Node stopped with an error");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn boot(network: &Arc<LocalNetwork>, member: Member) -> Result<Node> {
    let transport: Arc<dyn Transport> = network.clone();
    Node::init(member.config, member.signer, transport, member.inbound).await
}
