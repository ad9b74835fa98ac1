//! # status
//!
//! why: give operators and tests a point-in-time view of a node
//! relations: built by RaftNode::status from node.rs and progress.rs
//! what: Status, one diagnostic line per tracked peer

use crate::log::HardState;
use crate::node::NodeState;
use crate::progress::Progress;
use crate::{Index, NodeId};
use std::collections::BTreeMap;
use std::fmt;

/// Snapshot of a node's state. `progress` is only populated on the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: NodeId,
    pub hard_state: HardState,
    pub state: NodeState,
    pub leader: Option<NodeId>,
    pub applied: Index,
    pub last_index: Index,
    pub progress: BTreeMap<NodeId, Progress>,
}

impl Status {
    /// `<id>: <progress>` for every tracked peer, ordered by id.
    pub fn progress_lines(&self) -> Vec<String> {
        self.progress
            .iter()
            .map(|(id, pr)| format!("{id}: {pr}"))
            .collect()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.progress_lines().join("\n"))
    }
}
