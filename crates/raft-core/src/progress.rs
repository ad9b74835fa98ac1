//! # progress
//!
//! why: the leader's per-follower replication cursor and flow control
//! relations: lives inside the Leader role in node.rs, window from inflights.rs
//! what: ProgressState, Progress, ProgressTracker

use crate::inflights::Inflights;
use crate::quorum::Configuration;
use crate::{Index, NodeId};
use std::collections::BTreeMap;
use std::fmt;

/// How the leader is currently replicating to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Match point unknown; one append at a time
    Probe,
    /// Steady state; pipelined appends up to the inflight capacity
    Replicate,
    /// Peer needs entries that were compacted; a snapshot is in flight
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State{self:?}")
    }
}

/// Replication state of one peer, as seen by the leader.
///
/// Invariant: `matched < next`, and `matched` only grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Highest index known to be identical to the leader's log
    pub matched: Index,
    /// Next index to send
    pub next: Index,
    pub state: ProgressState,
    pub inflights: Inflights,
    /// No appends are sent while paused
    pub paused: bool,
    /// Index of the snapshot in flight while in Snapshot state
    pub pending_snapshot: Index,
    /// Leader ticks since the pending snapshot was sent
    pub snapshot_elapsed: u64,
    /// Commit index most recently transmitted to the peer
    pub sent_commit: Index,
    /// Highest commit index the peer has reported
    pub match_commit: Index,
    /// Heard from since the last quorum check
    pub recent_active: bool,
}

impl Progress {
    pub fn new(next: Index, max_inflight: usize) -> Self {
        Self {
            matched: 0,
            next,
            state: ProgressState::Probe,
            inflights: Inflights::new(max_inflight),
            paused: false,
            pending_snapshot: 0,
            snapshot_elapsed: 0,
            sent_commit: 0,
            match_commit: 0,
            recent_active: false,
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.paused = false;
        self.pending_snapshot = 0;
        self.snapshot_elapsed = 0;
        self.state = state;
        self.inflights.reset();
    }

    pub fn become_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            let pending = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next = (self.matched + 1).max(pending + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next = self.matched + 1;
        }
        self.sent_commit = self.sent_commit.min(self.next - 1);
    }

    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next = self.matched + 1;
    }

    pub fn become_snapshot(&mut self, snapshot_index: Index) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_index;
        self.next = snapshot_index + 1;
        self.sent_commit = snapshot_index;
        self.paused = true;
    }

    /// Count a leader tick while a snapshot is outstanding. Once `timeout`
    /// ticks pass without an acknowledgment the peer drops back to Probe, and
    /// the next append finds the compacted entries and resends the snapshot.
    pub fn tick_snapshot(&mut self, timeout: u64) -> bool {
        if self.state != ProgressState::Snapshot {
            return false;
        }
        self.snapshot_elapsed += 1;
        if self.snapshot_elapsed < timeout {
            return false;
        }
        self.pending_snapshot = 0;
        self.become_probe();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Account for an append carrying `entries` entries that was just sent.
    pub fn sent_entries(&mut self, entries: usize) {
        match self.state {
            ProgressState::Replicate => {
                if entries > 0 {
                    self.next += entries as Index;
                    self.inflights.add(self.next - 1);
                }
                self.paused = self.inflights.full();
            }
            ProgressState::Probe => self.paused = true,
            ProgressState::Snapshot => {}
        }
    }

    pub fn set_sent_commit(&mut self, commit: Index) {
        self.sent_commit = commit;
    }

    /// Whether sending `commit` could move the follower's commit index.
    pub fn can_bump_commit(&self, commit: Index) -> bool {
        commit > self.sent_commit && self.sent_commit < self.next - 1
    }

    pub fn update_match_commit(&mut self, commit: Index) {
        self.match_commit = self.match_commit.max(commit);
    }

    /// Successful acknowledgment up to `index`. Returns whether `matched`
    /// moved.
    pub fn maybe_update(&mut self, index: Index) -> bool {
        if index <= self.matched {
            return false;
        }
        self.matched = index;
        self.next = self.next.max(index + 1);
        if self.state != ProgressState::Snapshot {
            self.paused = false;
        }
        true
    }

    /// Rejection of the append at `rejected`, with the follower's hint of
    /// where the logs may still agree. Returns false for stale rejections.
    pub fn maybe_decr_to(&mut self, rejected: Index, hint: Index) -> bool {
        if self.state == ProgressState::Snapshot {
            return false;
        }
        if self.state == ProgressState::Replicate {
            if rejected <= self.matched {
                return false;
            }
            self.become_probe();
        } else if self.next - 1 != rejected {
            return false;
        }
        self.next = rejected.min(hint + 1).max(self.matched + 1);
        self.paused = false;
        true
    }

    /// Free acknowledged slots of the window.
    pub fn acknowledge(&mut self, index: Index) {
        self.inflights.free_le(index);
        self.paused = self.state == ProgressState::Replicate && self.inflights.full();
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} match={} next={} sentCommit={} matchCommit={}",
            self.state, self.matched, self.next, self.sent_commit, self.match_commit
        )?;
        if self.is_paused() {
            write!(f, " paused")?;
        }
        let count = self.inflights.count();
        if count > 0 {
            write!(f, " inflight={count}")?;
            if self.inflights.full() {
                write!(f, "[full]")?;
            }
        }
        Ok(())
    }
}

/// Progress of every member, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    progress: BTreeMap<NodeId, Progress>,
}

impl ProgressTracker {
    /// Fresh tracker for a new leader whose log ends at `last_index`.
    pub fn new(
        config: &Configuration,
        leader: NodeId,
        last_index: Index,
        max_inflight: usize,
    ) -> Self {
        let mut progress = BTreeMap::new();
        for id in config.members() {
            let mut pr = Progress::new(last_index + 1, max_inflight);
            if id == leader {
                pr.matched = last_index;
                pr.become_replicate();
                pr.recent_active = true;
            }
            progress.insert(id, pr);
        }
        Self { progress }
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Progress)> {
        self.progress.iter()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.progress.keys().copied().collect()
    }

    /// Quorum-th largest voter match.
    pub fn committed_index(&self, config: &Configuration) -> Index {
        config.committed_index(|id| self.progress.get(&id).map(|pr| pr.matched))
    }

    /// Whether a quorum of voters was active since the last check; clears the
    /// activity flags of everyone but `leader`.
    pub fn quorum_active(&mut self, config: &Configuration, leader: NodeId) -> bool {
        let active = config
            .voters()
            .iter()
            .filter(|id| {
                **id == leader || self.progress.get(id).map_or(false, |pr| pr.recent_active)
            })
            .count();
        for (id, pr) in self.progress.iter_mut() {
            pr.recent_active = *id == leader;
        }
        active >= config.quorum_size()
    }

    pub fn snapshot(&self) -> BTreeMap<NodeId, Progress> {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicating(matched: Index, capacity: usize) -> Progress {
        let mut pr = Progress::new(matched + 1, capacity);
        pr.matched = matched;
        pr.become_replicate();
        pr
    }

    #[test]
    fn probe_pauses_after_one_send() {
        let mut pr = Progress::new(5, 2);
        assert!(!pr.is_paused());
        pr.sent_entries(0);
        assert!(pr.is_paused());
        assert_eq!(pr.next, 5);
    }

    #[test]
    fn replicate_pauses_when_window_fills() {
        let mut pr = replicating(14, 2);
        pr.sent_entries(1);
        assert!(!pr.is_paused());
        pr.sent_entries(1);
        assert!(pr.is_paused());
        assert_eq!(pr.next, 17);
        assert_eq!(pr.inflights.count(), 2);

        pr.acknowledge(15);
        assert!(!pr.is_paused());
        assert_eq!(pr.inflights.count(), 1);
    }

    #[test]
    fn status_line_matches_diagnostic_format() {
        let mut pr = replicating(14, 2);
        pr.sent_entries(1);
        pr.sent_entries(1);
        pr.set_sent_commit(16);
        pr.update_match_commit(14);
        assert_eq!(
            pr.to_string(),
            "StateReplicate match=14 next=17 sentCommit=16 matchCommit=14 paused inflight=2[full]"
        );
    }

    #[test]
    fn maybe_update_keeps_match_below_next() {
        let mut pr = Progress::new(3, 2);
        assert!(pr.maybe_update(7));
        assert_eq!(pr.matched, 7);
        assert_eq!(pr.next, 8);
        assert!(!pr.maybe_update(6));
        assert_eq!(pr.matched, 7);
    }

    #[test]
    fn probe_ignores_stale_rejection() {
        let mut pr = Progress::new(10, 2);
        assert!(!pr.maybe_decr_to(5, 2));
        assert_eq!(pr.next, 10);
    }

    #[test]
    fn probe_regresses_to_hint() {
        let mut pr = Progress::new(10, 2);
        pr.sent_entries(0);
        assert!(pr.maybe_decr_to(9, 3));
        assert_eq!(pr.next, 4);
        assert!(!pr.is_paused());
    }

    #[test]
    fn replicate_rejection_clears_window_and_probes() {
        let mut pr = replicating(5, 2);
        pr.sent_entries(1);
        pr.sent_entries(1);
        assert!(pr.maybe_decr_to(7, 6));
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.inflights.count(), 0);
        assert_eq!(pr.next, 7);
        assert!(!pr.is_paused());

        // rejections at or below match are stale
        let mut pr = replicating(5, 2);
        assert!(!pr.maybe_decr_to(5, 0));
        assert_eq!(pr.state, ProgressState::Replicate);
    }

    #[test]
    fn snapshot_state_is_paused_and_resumes_after_it() {
        let mut pr = replicating(3, 2);
        pr.become_snapshot(20);
        assert!(pr.is_paused());
        assert_eq!(pr.next, 21);
        assert_eq!(pr.sent_commit, 20);

        pr.maybe_update(20);
        assert!(pr.is_paused());
        pr.become_probe();
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.matched, 20);
        assert_eq!(pr.next, 21);
        assert!(!pr.is_paused());
    }

    #[test]
    fn unacknowledged_snapshot_times_out() {
        let mut pr = replicating(3, 2);
        pr.become_snapshot(20);
        for _ in 0..9 {
            assert!(!pr.tick_snapshot(10));
        }
        assert_eq!(pr.state, ProgressState::Snapshot);

        assert!(pr.tick_snapshot(10));
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.pending_snapshot, 0);
        assert_eq!(pr.next, 4);
        assert_eq!(pr.sent_commit, 3);
        assert!(!pr.is_paused());

        // only Snapshot state counts ticks
        assert!(!pr.tick_snapshot(1));
        assert_eq!(pr.snapshot_elapsed, 0);
    }

    #[test]
    fn commit_bump_only_when_it_can_move_follower() {
        let mut pr = replicating(10, 2);
        pr.set_sent_commit(8);
        assert!(pr.can_bump_commit(10));
        pr.set_sent_commit(10);
        assert!(!pr.can_bump_commit(10));
        assert!(!pr.can_bump_commit(12));
    }

    #[test]
    fn tracker_starts_leader_replicating() {
        let config = Configuration::new([1, 2, 3]);
        let tracker = ProgressTracker::new(&config, 1, 6, 2);
        let leader = tracker.get(1).unwrap();
        assert_eq!(leader.state, ProgressState::Replicate);
        assert_eq!(leader.matched, 6);
        let follower = tracker.get(2).unwrap();
        assert_eq!(follower.state, ProgressState::Probe);
        assert_eq!((follower.matched, follower.next), (0, 7));
        assert_eq!(tracker.committed_index(&config), 0);
    }

    #[test]
    fn quorum_activity_resets_after_check() {
        let config = Configuration::new([1, 2, 3]);
        let mut tracker = ProgressTracker::new(&config, 1, 0, 2);
        assert!(!tracker.quorum_active(&config, 1));
        tracker.get_mut(3).unwrap().recent_active = true;
        assert!(tracker.quorum_active(&config, 1));
        assert!(!tracker.quorum_active(&config, 1));
    }
}
