//! # step
//!
//! why: route every inbound message through the term rules before any role
//! sees it
//! relations: entry point behind RaftNode::step, hands leader traffic to
//! replication.rs
//! what: term comparison, stale rejection, vote granting, follower append,
//! heartbeat and snapshot handling

use crate::error::Result;
use crate::log::{self, LogEntry, Snapshot};
use crate::message::{Message, MessageBody};
use crate::node::{RaftNode, Role};
use crate::storage::LogStore;
use crate::{Index, NodeId, Term};
use tracing::{debug, info, warn};

impl<S: LogStore> RaftNode<S> {
    pub(crate) fn step_message(&mut self, m: Message) -> Result<()> {
        if let MessageBody::Propose { entries } = m.body {
            let payloads = entries.into_iter().map(|e| e.payload).collect();
            return self.propose_payloads(payloads).map(|_| ());
        }

        if m.to != self.id {
            warn!(node = self.id, to = m.to, kind = %m.kind(), "dropping misaddressed message");
            return Ok(());
        }
        if !self.membership.contains(m.from) {
            warn!(
                node = self.id,
                from = m.from,
                kind = %m.kind(),
                "dropping message from non-member"
            );
            return Ok(());
        }

        if m.term > self.term {
            if m.is_vote_request() && self.in_lease() {
                debug!(
                    node = self.id,
                    term = self.term,
                    from = m.from,
                    msg_term = m.term,
                    "ignoring vote request, leader lease still held"
                );
                return Ok(());
            }
            match m.body {
                // a pre-vote never moves anyone's term
                MessageBody::PreVote { .. } => {}
                // the real election that follows will carry the term
                MessageBody::PreVoteResp { reject: false } => {}
                _ => {
                    info!(
                        node = self.id,
                        term = self.term,
                        msg_term = m.term,
                        from = m.from,
                        kind = %m.kind(),
                        "received message with higher term"
                    );
                    let leader = m.is_from_leader().then_some(m.from);
                    self.become_follower(m.term, leader);
                }
            }
        } else if m.term < self.term {
            return self.reject_stale(m);
        }

        if m.is_vote_request() {
            return self.handle_vote_request(m);
        }
        match self.role {
            Role::Leader { .. } => self.step_leader(m),
            Role::PreCandidate { .. } | Role::Candidate { .. } => self.step_candidate(m),
            Role::Follower => self.step_follower(m),
        }
    }

    /// Answer a lower-term request with a same-kind rejection carrying our
    /// term, so the sender steps down. Stale responses are dropped.
    fn reject_stale(&mut self, m: Message) -> Result<()> {
        let kind = m.kind();
        let commit = self.log.committed();
        let body = match m.body {
            MessageBody::App { log_index, .. } => MessageBody::AppResp {
                index: log_index,
                reject: true,
                reject_hint: 0,
                log_term: 0,
                commit,
            },
            MessageBody::Heartbeat { .. } => MessageBody::HeartbeatResp { commit },
            MessageBody::Vote { .. } => MessageBody::VoteResp { reject: true },
            MessageBody::PreVote { .. } => MessageBody::PreVoteResp { reject: true },
            MessageBody::Snapshot { snapshot } => MessageBody::SnapshotResp {
                index: snapshot.index,
                reject: true,
                commit,
            },
            _ => {
                debug!(
                    node = self.id,
                    from = m.from,
                    msg_term = m.term,
                    %kind,
                    "dropped stale response"
                );
                return Ok(());
            }
        };
        debug!(
            node = self.id,
            term = self.term,
            from = m.from,
            msg_term = m.term,
            %kind,
            "rejected stale message"
        );
        self.send(Message::new(self.id, m.from, self.term, body))
    }

    fn handle_vote_request(&mut self, m: Message) -> Result<()> {
        let (last_log_index, last_log_term, pre_vote) = match m.body {
            MessageBody::Vote {
                last_log_index,
                last_log_term,
            } => (last_log_index, last_log_term, false),
            MessageBody::PreVote {
                last_log_index,
                last_log_term,
            } => (last_log_index, last_log_term, true),
            _ => return Ok(()),
        };

        let can_vote = self.vote == Some(m.from)
            || (self.vote.is_none() && self.leader_id.is_none())
            || (pre_vote && m.term > self.term);
        let granted = can_vote && self.log.is_up_to_date(last_log_index, last_log_term);

        debug!(
            node = self.id,
            term = self.term,
            candidate = m.from,
            msg_term = m.term,
            pre_vote,
            granted,
            "answering vote request"
        );

        if granted && !pre_vote {
            // recorded before the grant is queued, so it is durable first
            self.election_elapsed = 0;
            self.vote = Some(m.from);
        }
        let reject = !granted;
        let body = if pre_vote {
            MessageBody::PreVoteResp { reject }
        } else {
            MessageBody::VoteResp { reject }
        };
        let term = if granted { m.term } else { self.term };
        self.send(Message::new(self.id, m.from, term, body))
    }

    fn step_follower(&mut self, m: Message) -> Result<()> {
        match m.body {
            MessageBody::App {
                log_term,
                log_index,
                entries,
                commit,
            } => {
                self.heard_from_leader(m.from);
                self.handle_append(m.from, log_index, log_term, entries, commit)
            }
            MessageBody::Heartbeat { commit } => {
                self.heard_from_leader(m.from);
                self.handle_heartbeat(m.from, commit)
            }
            MessageBody::Snapshot { snapshot } => {
                self.heard_from_leader(m.from);
                self.handle_snapshot(m.from, snapshot)
            }
            _ => {
                debug!(
                    node = self.id,
                    from = m.from,
                    kind = %m.kind(),
                    "follower ignoring message"
                );
                Ok(())
            }
        }
    }

    fn step_candidate(&mut self, m: Message) -> Result<()> {
        let pre_vote = matches!(self.role, Role::PreCandidate { .. });
        match m.body {
            MessageBody::App {
                log_term,
                log_index,
                entries,
                commit,
            } => {
                self.become_follower(m.term, Some(m.from));
                self.handle_append(m.from, log_index, log_term, entries, commit)
            }
            MessageBody::Heartbeat { commit } => {
                self.become_follower(m.term, Some(m.from));
                self.handle_heartbeat(m.from, commit)
            }
            MessageBody::Snapshot { snapshot } => {
                self.become_follower(m.term, Some(m.from));
                self.handle_snapshot(m.from, snapshot)
            }
            MessageBody::VoteResp { reject } if !pre_vote => {
                self.poll(m.from, !reject)?;
                Ok(())
            }
            MessageBody::PreVoteResp { reject } if pre_vote => {
                self.poll(m.from, !reject)?;
                Ok(())
            }
            _ => {
                debug!(
                    node = self.id,
                    from = m.from,
                    kind = %m.kind(),
                    "candidate ignoring message"
                );
                Ok(())
            }
        }
    }

    fn heard_from_leader(&mut self, leader: NodeId) {
        self.election_elapsed = 0;
        self.leader_id = Some(leader);
    }

    fn handle_append(
        &mut self,
        leader: NodeId,
        log_index: Index,
        log_term: Term,
        entries: Vec<LogEntry>,
        commit: Index,
    ) -> Result<()> {
        if !log::follows(log_index, &entries) {
            warn!(
                node = self.id,
                from = leader,
                log_index,
                "dropping append with misnumbered entries"
            );
            return Ok(());
        }
        let committed = self.log.committed();
        if log_index < committed {
            // everything up to our commit already matches the leader
            return self.send(Message::new(
                self.id,
                leader,
                self.term,
                MessageBody::AppResp {
                    index: committed,
                    reject: false,
                    reject_hint: 0,
                    log_term: 0,
                    commit: committed,
                },
            ));
        }

        let body = match self.log.maybe_append(log_index, log_term, commit, &entries)? {
            Some(last_new) => MessageBody::AppResp {
                index: last_new,
                reject: false,
                reject_hint: 0,
                log_term: 0,
                commit: self.log.committed(),
            },
            None => {
                let probe = log_index.min(self.log.last_index());
                let (hint_index, hint_term) = self.log.find_conflict_by_term(probe, log_term);
                debug!(
                    node = self.id,
                    term = self.term,
                    log_index,
                    log_term,
                    hint_index,
                    hint_term,
                    "rejected append, log does not match"
                );
                MessageBody::AppResp {
                    index: log_index,
                    reject: true,
                    reject_hint: hint_index,
                    log_term: hint_term,
                    commit: committed,
                }
            }
        };
        self.send(Message::new(self.id, leader, self.term, body))
    }

    fn handle_heartbeat(&mut self, leader: NodeId, commit: Index) -> Result<()> {
        self.log.commit_to(commit);
        let commit = self.log.committed();
        self.send(Message::new(
            self.id,
            leader,
            self.term,
            MessageBody::HeartbeatResp { commit },
        ))
    }

    fn handle_snapshot(&mut self, leader: NodeId, snapshot: Snapshot) -> Result<()> {
        let (index, snapshot_term) = (snapshot.index, snapshot.term);
        if index <= self.log.committed() {
            debug!(
                node = self.id,
                index,
                commit = self.log.committed(),
                "snapshot already covered by commit index"
            );
        } else if self.log.match_term(index, snapshot_term) {
            info!(
                node = self.id,
                index,
                "fast-forwarding commit to matching snapshot"
            );
            self.log.commit_to(index);
        } else {
            info!(
                node = self.id,
                term = self.term,
                index,
                snapshot_term,
                "restoring from snapshot"
            );
            self.log.restore(snapshot.clone())?;
            self.received_snapshot = Some(snapshot);
        }

        let commit = self.log.committed();
        self.send(Message::new(
            self.id,
            leader,
            self.term,
            MessageBody::SnapshotResp {
                index: commit,
                reject: false,
                commit,
            },
        ))
    }
}
