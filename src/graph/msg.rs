//! Pose-graph messages published to subscribers.

use serde::{Deserialize, Serialize};

use super::factor::{Factor, Node};

/// Snapshot (or incremental diff) of the pose graph.
///
/// Consumed by the visualization layer and by base stations merging
/// per-robot graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseGraphMsg {
    /// Stamp of the newest node in the message, in microseconds.
    pub stamp_us: u64,
    /// Fixed frame all poses are expressed in.
    pub fixed_frame_id: String,
    /// Whether this message is a diff since the last publication.
    pub incremental: bool,
    /// Nodes (all, or only the changed ones for a diff).
    pub nodes: Vec<Node>,
    /// Non-prior factors.
    pub edges: Vec<Factor>,
    /// Prior factors.
    pub priors: Vec<Factor>,
}

impl PoseGraphMsg {
    /// Whether the message carries no content.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.priors.is_empty()
    }
}
