//! # test cluster
//!
//! why: drive several nodes through a fake network from integration tests
//! relations: shared by comprehensive_tests.rs and cluster_tests.rs
//! what: Cluster with message queue, drop filters, partitions and safety checks

#![allow(dead_code)]

use raft_core::{
    Configuration, Index, LogEntry, LogStore, MemoryLogStore, Message, MessageKind, NodeId,
    ProgressState, RaftConfig, RaftNode, Snapshot, Term,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type Node = RaftNode<MemoryLogStore>;

type Filter = Box<dyn Fn(&Message) -> bool>;

/// In-process cluster over a FIFO network.
pub struct Cluster {
    pub nodes: BTreeMap<NodeId, Node>,
    pub queue: VecDeque<Message>,
    /// Every message a node emitted, dropped or not
    pub sent: Vec<Message>,
    /// Entries each node handed to its application
    pub applied: BTreeMap<NodeId, BTreeMap<Index, LogEntry>>,
    pub snapshots: BTreeMap<NodeId, Vec<Snapshot>>,
    filters: Vec<Filter>,
    isolated: BTreeSet<NodeId>,
    leaders: BTreeMap<Term, NodeId>,
    commits: BTreeMap<NodeId, Index>,
}

impl Cluster {
    pub fn new(ids: &[NodeId], config: RaftConfig) -> Self {
        Self::with_membership(Configuration::new(ids.iter().copied()), config)
    }

    pub fn with_membership(membership: Configuration, config: RaftConfig) -> Self {
        init_tracing();
        let nodes = membership
            .members()
            .map(|id| {
                let node = RaftNode::with_config(
                    id,
                    membership.clone(),
                    config.clone(),
                    MemoryLogStore::new(),
                )
                .unwrap();
                (id, node)
            })
            .collect();
        Self {
            nodes,
            queue: VecDeque::new(),
            sent: Vec::new(),
            applied: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            filters: Vec::new(),
            isolated: BTreeSet::new(),
            leaders: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).unwrap()
    }

    /// The leader of the highest term, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.term())
            .map(|n| n.id)
    }

    // -- network faults --

    pub fn drop_where(&mut self, filter: impl Fn(&Message) -> bool + 'static) {
        self.filters.push(Box::new(filter));
    }

    pub fn drop_kind_to(&mut self, kind: MessageKind, to: NodeId) {
        self.drop_where(move |m| m.kind() == kind && m.to == to);
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    pub fn isolate(&mut self, id: NodeId) {
        self.isolated.insert(id);
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
        self.filters.clear();
    }

    fn dropped(&self, m: &Message) -> bool {
        self.isolated.contains(&m.from)
            || self.isolated.contains(&m.to)
            || self.filters.iter().any(|f| f(m))
    }

    // -- driving --

    pub fn campaign(&mut self, id: NodeId) {
        self.node_mut(id).campaign().unwrap();
        self.collect();
    }

    pub fn propose(&mut self, id: NodeId, payload: &[u8]) -> Index {
        let index = self.node_mut(id).propose(payload.to_vec()).unwrap();
        self.collect();
        index
    }

    pub fn tick(&mut self, id: NodeId) {
        self.node_mut(id).tick().unwrap();
        self.collect();
    }

    pub fn tick_all(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.tick(id);
        }
    }

    /// Deliver one message unless the network drops it.
    pub fn deliver(&mut self, msg: Message) {
        if self.dropped(&msg) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&msg.to) {
            node.step(msg).unwrap();
        }
        self.collect();
    }

    /// Deliver queued messages, including the ones they cause, until the
    /// network is quiet.
    pub fn stabilize(&mut self) {
        let mut steps = 0;
        while let Some(msg) = self.queue.pop_front() {
            self.deliver(msg);
            steps += 1;
            assert!(steps < 100_000, "cluster did not stabilize");
        }
    }

    /// Drain every node's outputs and run the safety checks.
    pub fn collect(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let node = self.nodes.get_mut(&id).unwrap();
            let msgs = node.read_messages();
            let snapshot = node.read_snapshot();
            let committed = node.read_committed().unwrap();
            let commit = node.commit_index();
            let (term, is_leader) = (node.term(), node.is_leader());

            if let Some(snapshot) = snapshot {
                self.snapshots.entry(id).or_default().push(snapshot);
            }
            let applied = self.applied.entry(id).or_default();
            for entry in committed {
                assert!(
                    applied.insert(entry.index, entry.clone()).is_none(),
                    "node {id} applied index {} twice",
                    entry.index
                );
            }

            let previous = self.commits.insert(id, commit).unwrap_or(0);
            assert!(
                commit >= previous,
                "node {id} commit went from {previous} to {commit}"
            );

            if is_leader {
                let leader = *self.leaders.entry(term).or_insert(id);
                assert_eq!(leader, id, "two leaders in term {term}");
            }

            self.sent.extend(msgs.iter().cloned());
            self.queue.extend(msgs);
        }
        self.assert_state_machine_safety();
    }

    /// Entries applied at the same index are identical on every node.
    pub fn assert_state_machine_safety(&self) {
        let mut seen: BTreeMap<Index, &LogEntry> = BTreeMap::new();
        for entries in self.applied.values() {
            for (index, entry) in entries {
                let first = *seen.entry(*index).or_insert(entry);
                assert_eq!(first, entry, "different entries applied at index {index}");
            }
        }
    }

    /// If two logs hold an entry with the same index and term, they agree on
    /// every entry up to it.
    pub fn assert_log_matching(&self) {
        let logs: Vec<&[LogEntry]> = self.nodes.values().map(|n| n.store().entries()).collect();
        for a in &logs {
            for b in &logs {
                for ea in a.iter() {
                    let Some(eb) = b.iter().find(|e| e.index == ea.index) else {
                        continue;
                    };
                    if ea.term != eb.term {
                        continue;
                    }
                    for pa in a.iter().filter(|e| e.index < ea.index) {
                        if let Some(pb) = b.iter().find(|e| e.index == pa.index) {
                            assert_eq!(pa, pb, "logs diverge below matching index {}", ea.index);
                        }
                    }
                }
            }
        }
    }

    /// Messages emitted to `to` of the given kind.
    pub fn sent_to(&self, kind: MessageKind, to: NodeId) -> usize {
        self.sent.iter().filter(|m| m.kind() == kind && m.to == to).count()
    }

    /// Campaign `id` on a quiet network and deliver until it leads.
    pub fn elect(&mut self, id: NodeId) {
        self.campaign(id);
        self.stabilize();
        assert_eq!(self.leader(), Some(id));
    }

    /// Replication state of `id` as tracked by `leader`.
    pub fn peer_state(&self, leader: NodeId, id: NodeId) -> ProgressState {
        self.node(leader).progress(id).expect("not leading").state
    }

    pub fn entry_terms(&self, id: NodeId) -> Vec<(Index, Term)> {
        self.node(id)
            .store()
            .entries()
            .iter()
            .map(|e| (e.index, e.term))
            .collect()
    }

    pub fn last_index(&self, id: NodeId) -> Index {
        self.node(id).store().last_index()
    }
}
