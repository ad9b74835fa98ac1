//! # replication
//!
//! why: the leader's half of the protocol, deciding what each follower is
//! sent and when the commit index moves
//! relations: called from step.rs for leader traffic and node.rs for ticks
//! and proposals; reads and mutates progress.rs
//! what: proposals, append/heartbeat/snapshot sending, response handling,
//! commit calculation, unreachable/snapshot status reports

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::message::{Message, MessageBody};
use crate::node::{RaftNode, Role};
use crate::progress::ProgressState;
use crate::storage::{LogStore, StorageError};
use crate::{Index, NodeId, Term};
use tracing::{debug, info, warn};

impl<S: LogStore> RaftNode<S> {
    pub(crate) fn propose_payloads(&mut self, payloads: Vec<Vec<u8>>) -> Result<Index> {
        if !self.is_leader() {
            debug!(node = self.id, leader = ?self.leader_id, "dropping proposal, not the leader");
            return Err(RaftError::NotLeader {
                id: self.id,
                leader: self.leader_id,
            });
        }
        if payloads.is_empty() {
            return Ok(self.log.last_index());
        }
        self.append_local(payloads)
    }

    /// Append entries at the current term to the leader's own log, then try to
    /// commit and replicate them.
    pub(crate) fn append_local(&mut self, payloads: Vec<Vec<u8>>) -> Result<Index> {
        let first = self.log.last_index() + 1;
        let entries: Vec<LogEntry> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                LogEntry::new(self.term, first + i as Index, payload)
            })
            .collect();
        let last = self.log.append(&entries)?;
        debug!(
            node = self.id,
            term = self.term,
            first,
            last,
            "appended entries"
        );

        if let Role::Leader { progress } = &mut self.role {
            if let Some(pr) = progress.get_mut(self.id) {
                pr.maybe_update(last);
            }
        }
        self.maybe_commit()?;
        self.bcast_append()?;
        Ok(last)
    }

    pub(crate) fn step_leader(&mut self, m: Message) -> Result<()> {
        match m.body {
            MessageBody::AppResp {
                index,
                reject,
                reject_hint,
                log_term,
                commit,
            } => {
                self.handle_append_response(m.from, index, reject, reject_hint, log_term, commit)
            }
            MessageBody::HeartbeatResp { commit } => self.handle_heartbeat_response(m.from, commit),
            MessageBody::SnapshotResp {
                index,
                reject,
                commit,
            } => self.handle_snapshot_response(m.from, index, reject, commit),
            MessageBody::App { .. }
            | MessageBody::Heartbeat { .. }
            | MessageBody::Snapshot { .. } => {
                warn!(
                    node = self.id,
                    term = self.term,
                    from = m.from,
                    "another leader claims the current term"
                );
                Ok(())
            }
            _ => {
                debug!(node = self.id, from = m.from, kind = %m.kind(), "leader ignoring message");
                Ok(())
            }
        }
    }

    // -- commit --

    /// Adopt the quorum-th largest match index if it carries the current term.
    pub(crate) fn maybe_commit(&mut self) -> Result<bool> {
        let Role::Leader { progress } = &mut self.role else {
            return Ok(false);
        };
        let index = progress.committed_index(&self.membership);
        if !self.log.maybe_commit(index, self.term) {
            return Ok(false);
        }
        let committed = self.log.committed();
        if let Some(pr) = progress.get_mut(self.id) {
            pr.set_sent_commit(committed);
            pr.update_match_commit(committed);
        }
        debug!(
            node = self.id,
            term = self.term,
            committed,
            "advanced commit index"
        );
        self.persist_hard_state()?;
        Ok(true)
    }

    // -- sending --

    fn peers(&self) -> Vec<NodeId> {
        match &self.role {
            Role::Leader { progress } => progress
                .ids()
                .into_iter()
                .filter(|id| *id != self.id)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Send `to` whatever it is missing. Returns whether a message went out.
    ///
    /// With `send_if_empty` unset an append is only sent when it carries
    /// entries or moves the peer's commit index forward.
    pub(crate) fn maybe_send_append(&mut self, to: NodeId, send_if_empty: bool) -> Result<bool> {
        let committed = self.log.committed();
        let max_entries = self.config.max_entries_per_msg;
        let Role::Leader { progress } = &mut self.role else {
            return Ok(false);
        };
        let Some(pr) = progress.get_mut(to) else {
            return Ok(false);
        };
        if pr.is_paused() {
            return Ok(false);
        }

        let log_index = pr.next - 1;
        let log_term = match self.log.term(log_index) {
            Ok(term) => term,
            Err(StorageError::Compacted(_)) => return self.send_snapshot(to),
            Err(err) => return Err(err.into()),
        };
        let entries = match self.log.entries_from(pr.next, max_entries) {
            Ok(entries) => entries,
            Err(StorageError::Compacted(_)) => return self.send_snapshot(to),
            Err(err) => return Err(err.into()),
        };
        if entries.is_empty() && !send_if_empty && !pr.can_bump_commit(committed) {
            return Ok(false);
        }

        pr.sent_entries(entries.len());
        pr.set_sent_commit(committed);
        let body = MessageBody::App {
            log_term,
            log_index,
            entries,
            commit: committed,
        };
        self.send(Message::new(self.id, to, self.term, body))?;
        Ok(true)
    }

    pub(crate) fn bcast_append(&mut self) -> Result<()> {
        for to in self.peers() {
            self.maybe_send_append(to, false)?;
        }
        Ok(())
    }

    pub(crate) fn bcast_heartbeat(&mut self) -> Result<()> {
        let committed = self.log.committed();
        for to in self.peers() {
            let Role::Leader { progress } = &mut self.role else {
                return Ok(());
            };
            let Some(pr) = progress.get_mut(to) else {
                continue;
            };
            // never tell a follower to commit past what it is known to hold
            let commit = pr.matched.min(committed);
            if commit > pr.sent_commit {
                pr.set_sent_commit(commit);
            }
            self.send(Message::new(
                self.id,
                to,
                self.term,
                MessageBody::Heartbeat { commit },
            ))?;
        }
        Ok(())
    }

    fn send_snapshot(&mut self, to: NodeId) -> Result<bool> {
        let snapshot = self.log.snapshot()?;
        if snapshot.index == 0 {
            return Err(RaftError::Invariant(format!(
                "peer {to} needs compacted entries but no snapshot exists"
            )));
        }
        let Role::Leader { progress } = &mut self.role else {
            return Ok(false);
        };
        let Some(pr) = progress.get_mut(to) else {
            return Ok(false);
        };
        pr.become_snapshot(snapshot.index);
        info!(
            node = self.id,
            term = self.term,
            to,
            index = snapshot.index,
            snapshot_term = snapshot.term,
            "sending snapshot"
        );
        self.send(Message::new(
            self.id,
            to,
            self.term,
            MessageBody::Snapshot { snapshot },
        ))?;
        Ok(true)
    }

    /// Give up on snapshots no acknowledgment arrived for within an election
    /// timeout.
    pub(crate) fn expire_snapshots(&mut self) {
        let timeout = self.config.election_timeout_min;
        let Role::Leader { progress } = &mut self.role else {
            return;
        };
        for id in progress.ids() {
            let Some(pr) = progress.get_mut(id) else {
                continue;
            };
            if pr.tick_snapshot(timeout) {
                info!(
                    node = self.id,
                    term = self.term,
                    to = id,
                    "snapshot not acknowledged, probing again"
                );
            }
        }
    }

    // -- responses --

    fn handle_append_response(
        &mut self,
        from: NodeId,
        index: Index,
        reject: bool,
        reject_hint: Index,
        log_term: Term,
        commit: Index,
    ) -> Result<()> {
        let first_index = self.log.first_index();
        let Role::Leader { progress } = &mut self.role else {
            return Ok(());
        };
        let Some(pr) = progress.get_mut(from) else {
            return Ok(());
        };
        pr.recent_active = true;
        pr.update_match_commit(commit);

        if reject {
            let next_probe = if log_term > 0 {
                self.log.find_conflict_by_term(reject_hint, log_term).0
            } else {
                reject_hint
            };
            if pr.maybe_decr_to(index, next_probe) {
                debug!(
                    node = self.id,
                    to = from,
                    rejected = index,
                    next = pr.next,
                    "append rejected, backing off"
                );
                self.maybe_send_append(from, true)?;
            }
            return Ok(());
        }

        let probe_matched = pr.state == ProgressState::Probe && pr.matched == index;
        if !(pr.maybe_update(index) || probe_matched) {
            return Ok(());
        }
        match pr.state {
            ProgressState::Probe => pr.become_replicate(),
            // the log caught up with the peer while the snapshot was in flight
            ProgressState::Snapshot if pr.matched + 1 >= first_index => {
                pr.become_probe();
                pr.become_replicate();
            }
            ProgressState::Snapshot => {}
            ProgressState::Replicate => pr.acknowledge(index),
        }

        if self.maybe_commit()? {
            self.bcast_append()?;
        }
        while self.maybe_send_append(from, false)? {}
        Ok(())
    }

    fn handle_heartbeat_response(&mut self, from: NodeId, commit: Index) -> Result<()> {
        let last_index = self.log.last_index();
        let committed = self.log.committed();
        let Role::Leader { progress } = &mut self.role else {
            return Ok(());
        };
        let Some(pr) = progress.get_mut(from) else {
            return Ok(());
        };
        pr.recent_active = true;
        pr.update_match_commit(commit);
        match pr.state {
            ProgressState::Probe => pr.paused = false,
            // a lost append must not stall the window forever
            ProgressState::Replicate if pr.inflights.full() => {
                pr.inflights.free_first_one();
                pr.paused = false;
            }
            // the snapshot landed but its acknowledgment was lost
            ProgressState::Snapshot if commit >= pr.pending_snapshot => {
                pr.maybe_update(commit.min(last_index));
                pr.become_probe();
                debug!(
                    node = self.id,
                    from,
                    commit,
                    "heartbeat acknowledged snapshot"
                );
            }
            _ => {}
        }

        if pr.matched < last_index || pr.match_commit < committed {
            self.maybe_send_append(from, true)?;
        }
        Ok(())
    }

    fn handle_snapshot_response(
        &mut self,
        from: NodeId,
        index: Index,
        reject: bool,
        commit: Index,
    ) -> Result<()> {
        let Role::Leader { progress } = &mut self.role else {
            return Ok(());
        };
        let Some(pr) = progress.get_mut(from) else {
            return Ok(());
        };
        pr.recent_active = true;
        pr.update_match_commit(commit);

        if pr.state != ProgressState::Snapshot {
            debug!(
                node = self.id,
                from,
                index,
                "ignoring snapshot response, no snapshot pending"
            );
            return Ok(());
        }
        if reject {
            pr.become_probe();
            pr.paused = true;
            debug!(
                node = self.id,
                from,
                "snapshot rejected, waiting for next heartbeat"
            );
            return Ok(());
        }
        if index < pr.pending_snapshot {
            debug!(
                node = self.id,
                from,
                index,
                pending = pr.pending_snapshot,
                "ignoring stale snapshot response"
            );
            return Ok(());
        }

        pr.maybe_update(index);
        pr.become_probe();
        info!(
            node = self.id,
            from,
            index,
            "snapshot installed on follower"
        );
        while self.maybe_send_append(from, false)? {}
        Ok(())
    }

    // -- driver reports --

    /// The transport could not reach `id`; stop streaming and probe again.
    pub fn report_unreachable(&mut self, id: NodeId) {
        let Role::Leader { progress } = &mut self.role else {
            return;
        };
        if let Some(pr) = progress.get_mut(id) {
            if pr.state == ProgressState::Replicate {
                debug!(node = self.id, to = id, "peer unreachable, probing");
                pr.become_probe();
            }
        }
    }

    /// Outcome of delivering a snapshot, reported by the transport.
    pub fn report_snapshot(&mut self, id: NodeId, success: bool) {
        let Role::Leader { progress } = &mut self.role else {
            return;
        };
        let Some(pr) = progress.get_mut(id) else {
            return;
        };
        if pr.state != ProgressState::Snapshot {
            return;
        }
        if !success {
            pr.pending_snapshot = 0;
        }
        pr.become_probe();
        pr.paused = true;
        debug!(node = self.id, to = id, success, "snapshot status reported");
    }
}
