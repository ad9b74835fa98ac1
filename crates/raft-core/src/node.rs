//! # node
//!
//! why: define the raft node state machine and its driver-facing api
//! relations: step.rs dispatches messages, replication.rs drives followers
//! what: NodeState, RaftNode, election/heartbeat timers, role transitions

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::{HardState, LogEntry, RaftLog, Snapshot};
use crate::message::{Message, MessageBody};
use crate::progress::{Progress, ProgressTracker};
use crate::quorum::{Configuration, VoteResult};
use crate::status::Status;
use crate::storage::LogStore;
use crate::{Index, NodeId, Term};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// The four roles a Raft node moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - accepts entries from the leader, votes when asked
    Follower,
    /// Probing state - asks whether an election could be won without
    /// bumping the term
    PreCandidate,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Per-role state. Replication progress only exists while leading.
#[derive(Debug)]
pub(crate) enum Role {
    Follower,
    PreCandidate { votes: BTreeMap<NodeId, bool> },
    Candidate { votes: BTreeMap<NodeId, bool> },
    Leader { progress: ProgressTracker },
}

impl Role {
    fn state(&self) -> NodeState {
        match self {
            Role::Follower => NodeState::Follower,
            Role::PreCandidate { .. } => NodeState::PreCandidate,
            Role::Candidate { .. } => NodeState::Candidate,
            Role::Leader { .. } => NodeState::Leader,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CampaignKind {
    PreElection,
    Election,
}

/// A single Raft node.
///
/// The node is driven synchronously: the embedding driver calls `tick()`,
/// `step()` and `propose()`, then drains `read_messages()`,
/// `read_committed()` and `read_snapshot()`. Nothing inside blocks or spawns;
/// hard state and entries reach the log store before any message that
/// depends on them is handed out.
#[derive(Debug)]
pub struct RaftNode<S: LogStore> {
    /// Unique identifier for this node
    pub id: NodeId,
    pub(crate) term: Term,
    pub(crate) vote: Option<NodeId>,
    pub(crate) role: Role,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) log: RaftLog<S>,
    pub(crate) membership: Configuration,
    pub(crate) config: RaftConfig,
    rng: StdRng,
    pub(crate) election_elapsed: u64,
    heartbeat_elapsed: u64,
    randomized_election_timeout: u64,
    msgs: Vec<Message>,
    persisted: HardState,
    pub(crate) received_snapshot: Option<Snapshot>,
}

impl<S: LogStore> RaftNode<S> {
    /// Create a node with the default config and the given voters
    pub fn new(id: NodeId, voters: impl IntoIterator<Item = NodeId>, store: S) -> Result<Self> {
        Self::with_config(id, Configuration::new(voters), RaftConfig::default(), store)
    }

    /// Create (or restart) a node on top of `store`. Term, vote and commit
    /// index come from the store's hard state; the node always starts as a
    /// follower.
    pub fn with_config(
        id: NodeId,
        membership: Configuration,
        config: RaftConfig,
        store: S,
    ) -> Result<Self> {
        config.validate()?;
        membership.validate()?;

        let persisted = store.hard_state();
        let log = RaftLog::new(store);
        if persisted.commit > log.last_index() {
            return Err(RaftError::Invariant(format!(
                "persisted commit {} is beyond last index {}",
                persisted.commit,
                log.last_index()
            )));
        }

        let rng = StdRng::seed_from_u64(config.seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut node = Self {
            id,
            term: persisted.term,
            vote: persisted.vote,
            role: Role::Follower,
            leader_id: None,
            log,
            membership,
            config,
            rng,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            msgs: Vec::new(),
            persisted,
            received_snapshot: None,
        };
        node.reset_randomized_election_timeout();

        info!(
            node = id,
            term = node.term,
            commit = node.log.committed(),
            last_index = node.log.last_index(),
            "raft node started"
        );
        Ok(node)
    }

    // -- driver api --

    /// Advance logical time by one tick.
    pub fn tick(&mut self) -> Result<()> {
        match self.role {
            Role::Leader { .. } => self.tick_heartbeat()?,
            _ => self.tick_election()?,
        }
        self.persist_hard_state()
    }

    /// Process one inbound message.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.step_message(msg)?;
        self.persist_hard_state()
    }

    /// Propose a payload for replication. Only the leader accepts proposals;
    /// others return `RaftError::NotLeader` with the leader they know of.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<Index> {
        let index = self.propose_payloads(vec![payload])?;
        self.persist_hard_state()?;
        Ok(index)
    }

    /// Start an election right away instead of waiting for the timeout.
    pub fn campaign(&mut self) -> Result<()> {
        self.hup()?;
        self.persist_hard_state()
    }

    /// Drain outbound messages in the order they were generated.
    pub fn read_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.msgs)
    }

    /// Drain newly committed entries. Empty-payload entries are leader
    /// no-ops and can be skipped by the application.
    pub fn read_committed(&mut self) -> Result<Vec<LogEntry>> {
        self.log.next_committed()
    }

    /// A snapshot installed from the leader that the application must
    /// restore before applying further entries.
    pub fn read_snapshot(&mut self) -> Option<Snapshot> {
        self.received_snapshot.take()
    }

    /// Snapshot the application state at `index` (already applied) and
    /// discard the log up to it.
    pub fn compact(&mut self, index: Index, data: Vec<u8>) -> Result<Snapshot> {
        let snapshot = self.log.compact(index, data)?;
        info!(
            node = self.id,
            index = snapshot.index,
            term = snapshot.term,
            "compacted log"
        );
        Ok(snapshot)
    }

    pub fn status(&self) -> Status {
        let progress = match &self.role {
            Role::Leader { progress } => progress.snapshot(),
            _ => BTreeMap::new(),
        };
        Status {
            id: self.id,
            hard_state: self.hard_state(),
            state: self.state(),
            leader: self.leader_id,
            applied: self.log.applied(),
            last_index: self.log.last_index(),
            progress,
        }
    }

    // -- accessors --

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn vote(&self) -> Option<NodeId> {
        self.vote
    }

    pub fn state(&self) -> NodeState {
        self.role.state()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> Index {
        self.log.committed()
    }

    pub fn applied_index(&self) -> Index {
        self.log.applied()
    }

    pub fn last_log_index(&self) -> Index {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn membership(&self) -> &Configuration {
        &self.membership
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.log.store()
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.committed(),
        }
    }

    /// Leader's view of a peer's replication.
    pub fn progress(&self, id: NodeId) -> Option<&Progress> {
        match &self.role {
            Role::Leader { progress } => progress.get(id),
            _ => None,
        }
    }

    // -- timers --

    fn tick_election(&mut self) -> Result<()> {
        self.election_elapsed += 1;
        if self.promotable() && self.election_elapsed >= self.randomized_election_timeout {
            self.election_elapsed = 0;
            debug!(node = self.id, term = self.term, "election timeout");
            self.hup()?;
        }
        Ok(())
    }

    fn tick_heartbeat(&mut self) -> Result<()> {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.config.election_timeout_min {
            self.election_elapsed = 0;
            if self.config.check_quorum && !self.quorum_active() {
                warn!(
                    node = self.id,
                    term = self.term,
                    "no quorum heard from within an election timeout, stepping down"
                );
                self.become_follower(self.term, None);
                return Ok(());
            }
        }

        self.expire_snapshots();
        if self.heartbeat_elapsed >= self.config.heartbeat_interval {
            self.heartbeat_elapsed = 0;
            self.bcast_heartbeat()?;
        }
        Ok(())
    }

    fn quorum_active(&mut self) -> bool {
        match &mut self.role {
            Role::Leader { progress } => progress.quorum_active(&self.membership, self.id),
            _ => true,
        }
    }

    fn reset_randomized_election_timeout(&mut self) {
        let (min, max) = (self.config.election_timeout_min, self.config.election_timeout_max);
        self.randomized_election_timeout = self.rng.gen_range(min..max);
    }

    /// Whether a follower that heard from a leader recently should ignore
    /// vote requests.
    pub(crate) fn in_lease(&self) -> bool {
        self.config.check_quorum
            && self.leader_id.is_some()
            && self.election_elapsed < self.config.election_timeout_min
    }

    fn promotable(&self) -> bool {
        self.membership.is_voter(self.id)
    }

    // -- elections --

    pub(crate) fn hup(&mut self) -> Result<()> {
        if self.is_leader() {
            debug!(node = self.id, "ignoring campaign request, already leader");
            return Ok(());
        }
        if !self.promotable() {
            warn!(node = self.id, "not a voter, refusing to campaign");
            return Ok(());
        }
        if self.config.pre_vote {
            self.campaign_with(CampaignKind::PreElection)
        } else {
            self.campaign_with(CampaignKind::Election)
        }
    }

    fn campaign_with(&mut self, kind: CampaignKind) -> Result<()> {
        let term = match kind {
            CampaignKind::PreElection => {
                self.become_pre_candidate();
                self.term + 1
            }
            CampaignKind::Election => {
                self.become_candidate();
                self.term
            }
        };
        if self.poll(self.id, true)? == VoteResult::Won {
            return Ok(());
        }

        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        let peers: Vec<NodeId> = self
            .membership
            .voters()
            .iter()
            .copied()
            .filter(|id| *id != self.id)
            .collect();
        for to in peers {
            let body = match kind {
                CampaignKind::PreElection => MessageBody::PreVote {
                    last_log_index,
                    last_log_term,
                },
                CampaignKind::Election => MessageBody::Vote {
                    last_log_index,
                    last_log_term,
                },
            };
            self.send(Message::new(self.id, to, term, body))?;
        }
        Ok(())
    }

    /// Record a (pre-)vote and act on the tally.
    pub(crate) fn poll(&mut self, from: NodeId, granted: bool) -> Result<VoteResult> {
        let (votes, pre_vote) = match &mut self.role {
            Role::PreCandidate { votes } => (votes, true),
            Role::Candidate { votes } => (votes, false),
            _ => return Ok(VoteResult::Pending),
        };
        votes.entry(from).or_insert(granted);
        let result = self.membership.vote_result(votes);
        debug!(
            node = self.id,
            term = self.term,
            from,
            granted,
            pre_vote,
            ?result,
            "counted vote"
        );

        match result {
            VoteResult::Won if pre_vote => self.campaign_with(CampaignKind::Election)?,
            VoteResult::Won => self.become_leader()?,
            VoteResult::Lost => self.become_follower(self.term, None),
            VoteResult::Pending => {}
        }
        Ok(result)
    }

    // -- role transitions --

    fn reset(&mut self, term: Term) {
        if self.term != term {
            self.term = term;
            self.vote = None;
        }
        self.leader_id = None;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();
    }

    pub(crate) fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        self.reset(term);
        self.role = Role::Follower;
        self.leader_id = leader;
        info!(node = self.id, term, leader = ?leader, "became follower");
    }

    fn become_pre_candidate(&mut self) {
        self.role = Role::PreCandidate {
            votes: BTreeMap::new(),
        };
        self.leader_id = None;
        self.reset_randomized_election_timeout();
        info!(node = self.id, term = self.term, "became pre-candidate");
    }

    fn become_candidate(&mut self) {
        self.reset(self.term + 1);
        self.vote = Some(self.id);
        self.role = Role::Candidate {
            votes: BTreeMap::new(),
        };
        info!(node = self.id, term = self.term, "became candidate");
    }

    fn become_leader(&mut self) -> Result<()> {
        self.reset(self.term);
        self.leader_id = Some(self.id);
        let progress = ProgressTracker::new(
            &self.membership,
            self.id,
            self.log.last_index(),
            self.config.max_inflight,
        );
        self.role = Role::Leader { progress };
        info!(
            node = self.id,
            term = self.term,
            last_index = self.log.last_index(),
            "became leader"
        );

        // an entry from the new term lets earlier entries commit
        self.append_local(vec![Vec::new()])?;
        Ok(())
    }

    // -- outbound --

    /// Queue a message; hard state reaches the store first.
    pub(crate) fn send(&mut self, msg: Message) -> Result<()> {
        self.persist_hard_state()?;
        self.msgs.push(msg);
        Ok(())
    }

    pub(crate) fn persist_hard_state(&mut self) -> Result<()> {
        let hard_state = self.hard_state();
        if hard_state == self.persisted {
            return Ok(());
        }
        if hard_state.term < self.persisted.term || hard_state.commit < self.persisted.commit {
            return Err(RaftError::Invariant(format!(
                "hard state would regress from {:?} to {:?}",
                self.persisted, hard_state
            )));
        }
        self.log.store_mut().set_hard_state(hard_state.clone())?;
        self.persisted = hard_state;
        Ok(())
    }
}
