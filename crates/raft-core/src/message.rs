//! # message
//!
//! why: define every message raft nodes exchange
//! relations: produced and consumed by node.rs, serialized by the transport
//! what: Message envelope, MessageBody tagged union, MessageKind

use crate::log::{LogEntry, Snapshot};
use crate::{Index, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message between two nodes (or from the driver to the local node for
/// proposals).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    /// Sender's term; for PreVote it is the term the sender would campaign in
    pub term: Term,
    pub body: MessageBody,
}

/// Kind-specific message fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Request a vote during leader election
    Vote {
        last_log_index: Index,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResp { reject: bool },
    /// Ask whether an election would be won, without bumping any term
    PreVote {
        last_log_index: Index,
        last_log_term: Term,
    },
    /// Response to a pre-vote request
    PreVoteResp { reject: bool },
    /// Replicate log entries; `entries` follow the entry at `log_index`
    App {
        log_term: Term,
        log_index: Index,
        entries: Vec<LogEntry>,
        commit: Index,
    },
    /// Response to App. On success `index` is the last matching index; on
    /// rejection it is the rejected `log_index` and `(reject_hint, log_term)`
    /// points at where the leader should probe next.
    AppResp {
        index: Index,
        reject: bool,
        reject_hint: Index,
        log_term: Term,
        commit: Index,
    },
    /// Leader liveness; carries a commit index safe for the follower
    Heartbeat { commit: Index },
    /// Response to Heartbeat with the follower's commit index
    HeartbeatResp { commit: Index },
    /// Full state transfer for followers behind the leader's retained floor
    Snapshot { snapshot: Snapshot },
    /// Response to Snapshot
    SnapshotResp {
        index: Index,
        reject: bool,
        commit: Index,
    },
    /// Local proposal of new payloads
    Propose { entries: Vec<LogEntry> },
}

/// Message kinds, for filtering and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Vote,
    VoteResp,
    PreVote,
    PreVoteResp,
    App,
    AppResp,
    Heartbeat,
    HeartbeatResp,
    Snapshot,
    SnapshotResp,
    Propose,
}

impl Message {
    pub fn new(from: NodeId, to: NodeId, term: Term, body: MessageBody) -> Self {
        Self {
            from,
            to,
            term,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Vote { .. } => MessageKind::Vote,
            MessageBody::VoteResp { .. } => MessageKind::VoteResp,
            MessageBody::PreVote { .. } => MessageKind::PreVote,
            MessageBody::PreVoteResp { .. } => MessageKind::PreVoteResp,
            MessageBody::App { .. } => MessageKind::App,
            MessageBody::AppResp { .. } => MessageKind::AppResp,
            MessageBody::Heartbeat { .. } => MessageKind::Heartbeat,
            MessageBody::HeartbeatResp { .. } => MessageKind::HeartbeatResp,
            MessageBody::Snapshot { .. } => MessageKind::Snapshot,
            MessageBody::SnapshotResp { .. } => MessageKind::SnapshotResp,
            MessageBody::Propose { .. } => MessageKind::Propose,
        }
    }

    /// Messages only a leader sends.
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::App | MessageKind::Heartbeat | MessageKind::Snapshot
        )
    }

    pub fn is_vote_request(&self) -> bool {
        matches!(self.kind(), MessageKind::Vote | MessageKind::PreVote)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
