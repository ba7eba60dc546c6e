//! The two axes of node behavior.

use chronicle_types::{Duty, NodeId};
use serde::Serialize;

/// Where the node is in its lifecycle and the round cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    RequestNeighbors,
    RequestFirstBlock,
    RequestLatestBlock,
    /// Competition phase: between PotStart and PotOver.
    InPot,
    /// Decision phase: between PotOver and PotStart.
    PostPot,
}

impl Stage {
    /// Startup is done once the round cycle is entered.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::InPot | Self::PostPot)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestNeighbors => "request_neighbors",
            Self::RequestFirstBlock => "request_first_block",
            Self::RequestLatestBlock => "request_latest_block",
            Self::InPot => "in_pot",
            Self::PostPot => "post_pot",
        };
        f.write_str(s)
    }
}

/// The node's role in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    /// Broadcast a proof this round.
    Competitor,
    /// Not competing this round.
    Witness,
    /// Judged itself best; broadcast its candidate block.
    Winner,
    /// Seed that relayed its judgement.
    Judger,
    /// Peer waiting for the decision.
    Learner,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Competitor => "competitor",
            Self::Witness => "witness",
            Self::Winner => "winner",
            Self::Judger => "judger",
            Self::Learner => "learner",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub duty: Duty,
    pub stage: Stage,
    pub state: State,
    pub tip_height: u64,
    pub max_index: u64,
    pub discontinuous: bool,
    /// Producer of the most recently decided block.
    pub last_winner: Option<NodeId>,
    /// PotStart boundaries handled so far.
    pub round: u64,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} stage={} state={} tip={} max={}",
            self.duty, self.id, self.stage, self.state, self.tip_height, self.max_index
        )?;
        if self.discontinuous {
            f.write_str(" discontinuous")?;
        }
        Ok(())
    }
}
