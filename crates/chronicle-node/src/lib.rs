//! Chronicle Node
//!
//! A participant in a seed-judged, tick-driven block competition. Peers
//! compete for each height by broadcasting a compact proof of their
//! candidate block; seeds judge the proofs they saw and relay their pick;
//! the round's winner reveals the block body.
//!
//! # Architecture
//!
//! - **Dispatcher**: decodes, authenticates and routes inbound frames
//! - **Engine**: the round state machine, driven only by clock events
//! - **Startup**: membership, genesis agreement and catch-up before the first round
//! - **Outbox**: latency-delayed delivery over any [`Transport`](chronicle_protocols::Transport)
//! - **LocalCluster**: several nodes sharing one in-process network
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use chronicle_node::{ClusterConfig, LocalCluster};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = LocalCluster::start(ClusterConfig::default()).await?;
//!     cluster.wait_for_height(3, Duration::from_secs(10)).await;
//!     cluster.close().await?;
//!     Ok(())
//! }
//! ```

mod cluster;
mod config;
mod context;
mod dispatch;
mod engine;
mod error;
mod node;
mod outbox;
mod stage;
mod startup;
mod txpool;

pub use cluster::LocalCluster;
pub use config::{ClusterConfig, ConfigError, LatencyRange, NeighborConfig, NodeConfig, SigningMode};
pub use context::NodeContext;
pub use error::{NodeError, Result};
pub use node::Node;
pub use outbox::Outbox;
pub use stage::{NodeStatus, Stage, State};
pub use txpool::TxPool;
