//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted through a LogStore
//! what: LogEntry, HardState, Snapshot, RaftLog (log matching, commit index)

use crate::error::{RaftError, Result};
use crate::storage::{LogStore, StorageError};
use crate::{Index, NodeId, Term};
use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: Index,
    /// The command to be applied to the state machine
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: Index, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

/// State that must survive a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub vote: Option<NodeId>,
    pub commit: Index,
}

/// A compacted log prefix plus the application state it produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: Index,
    pub term: Term,
    pub data: Vec<u8>,
}

/// The node's view of its log: a store plus commit/apply cursors.
///
/// Entries are never held here; every read goes through the store so that
/// compaction is always observed.
#[derive(Debug)]
pub struct RaftLog<S: LogStore> {
    store: S,
    committed: Index,
    applied: Index,
}

impl<S: LogStore> RaftLog<S> {
    /// Wrap a store, resuming from its persisted commit index. Everything above
    /// the retained floor is handed to the application again.
    pub fn new(store: S) -> Self {
        let floor = store.first_index() - 1;
        let committed = store.hard_state().commit.max(floor);
        Self {
            store,
            committed,
            applied: floor,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn committed(&self) -> Index {
        self.committed
    }

    pub fn applied(&self) -> Index {
        self.applied
    }

    pub fn first_index(&self) -> Index {
        self.store.first_index()
    }

    pub fn last_index(&self) -> Index {
        self.store.last_index()
    }

    pub fn last_term(&self) -> Term {
        // the last index is always the floor or a retained entry
        self.store.term_at(self.last_index()).unwrap_or(0)
    }

    pub fn term(&self, index: Index) -> std::result::Result<Term, StorageError> {
        self.store.term_at(index)
    }

    pub fn match_term(&self, index: Index, term: Term) -> bool {
        matches!(self.store.term_at(index), Ok(t) if t == term)
    }

    /// Whether a candidate whose log ends at `(last_index, last_term)` is at
    /// least as up to date as this log.
    pub fn is_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    /// Index of the first entry that is missing or has a different term, or 0
    /// when every entry is already present.
    pub fn find_conflict(&self, entries: &[LogEntry]) -> Index {
        entries
            .iter()
            .find(|e| !self.match_term(e.index, e.term))
            .map(|e| e.index)
            .unwrap_or(0)
    }

    /// Largest index `<= index` whose term is `<= term`, together with that
    /// term. Stops at the retained floor, answering with term 0 below it.
    pub fn find_conflict_by_term(&self, index: Index, term: Term) -> (Index, Term) {
        let mut index = index;
        loop {
            match self.store.term_at(index) {
                Ok(t) if t > term && index > 0 => index -= 1,
                Ok(t) => return (index, t),
                Err(_) => return (index, 0),
            }
        }
    }

    /// Entries starting at `index`, empty when `index` is one past the end.
    pub fn entries_from(
        &self,
        index: Index,
        max: usize,
    ) -> std::result::Result<Vec<LogEntry>, StorageError> {
        if index > self.last_index() {
            return Ok(Vec::new());
        }
        self.store.entries_from(index, max)
    }

    /// Append locally created entries and return the new last index.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<Index> {
        if let Some(first) = entries.first() {
            if first.index <= self.committed {
                return Err(RaftError::Invariant(format!(
                    "append at {} would overwrite committed index {}",
                    first.index, self.committed
                )));
            }
            self.store.append(entries)?;
        }
        Ok(self.last_index())
    }

    /// Log matching for an append from the leader. Returns the index of the
    /// last entry known to match the leader, or `None` when the entry at
    /// `log_index` does not carry `log_term` or `entries` do not directly
    /// follow `log_index`.
    pub fn maybe_append(
        &mut self,
        log_index: Index,
        log_term: Term,
        commit: Index,
        entries: &[LogEntry],
    ) -> Result<Option<Index>> {
        if !follows(log_index, entries) || !self.match_term(log_index, log_term) {
            return Ok(None);
        }

        let last_new = log_index + entries.len() as Index;
        let conflict = self.find_conflict(entries);
        if conflict != 0 {
            if conflict <= self.committed {
                return Err(RaftError::Invariant(format!(
                    "entry {} conflicts with committed index {}",
                    conflict, self.committed
                )));
            }
            let start = (conflict - log_index - 1) as usize;
            self.store.append(&entries[start..])?;
        }

        self.commit_to(commit.min(last_new));
        Ok(Some(last_new))
    }

    /// Advance the commit index; never moves it backwards.
    pub fn commit_to(&mut self, index: Index) {
        let index = index.min(self.last_index());
        if index > self.committed {
            self.committed = index;
        }
    }

    /// Commit `index` only if it carries `term`.
    pub fn maybe_commit(&mut self, index: Index, term: Term) -> bool {
        if index > self.committed && self.match_term(index, term) {
            self.commit_to(index);
            return true;
        }
        false
    }

    /// Committed entries not yet handed to the application.
    pub fn next_committed(&mut self) -> Result<Vec<LogEntry>> {
        if self.applied >= self.committed {
            return Ok(Vec::new());
        }
        let count = (self.committed - self.applied) as usize;
        let entries = self.store.entries_from(self.applied + 1, count)?;
        if let Some(last) = entries.last() {
            self.applied = last.index;
        }
        Ok(entries)
    }

    /// Replace the log with a snapshot from the leader.
    pub fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.index;
        self.store.apply_snapshot(snapshot)?;
        self.committed = index;
        self.applied = index;
        Ok(())
    }

    /// Snapshot the application state at `index` and drop the log prefix.
    pub fn compact(&mut self, index: Index, data: Vec<u8>) -> Result<Snapshot> {
        if index > self.applied {
            return Err(RaftError::CompactBeyondApplied {
                index,
                applied: self.applied,
            });
        }
        let snapshot = self.store.create_snapshot(index, data)?;
        self.store.compact_to(index)?;
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.store.snapshot()?)
    }
}

/// Whether `entries` are numbered consecutively from `log_index + 1`.
pub(crate) fn follows(log_index: Index, entries: &[LogEntry]) -> bool {
    entries
        .iter()
        .zip(log_index + 1..)
        .all(|(entry, index)| entry.index == index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;

    fn log_with(terms: &[Term]) -> RaftLog<MemoryLogStore> {
        let mut log = RaftLog::new(MemoryLogStore::new());
        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::new(*t, i as Index + 1, vec![]))
            .collect();
        log.append(&entries).unwrap();
        log
    }

    #[test]
    fn empty_log_matches_index_zero() {
        let log = log_with(&[]);
        assert!(log.match_term(0, 0));
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_with(&[1, 2, 2]);
        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(3, 2));
        assert!(!log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(10, 1));
    }

    #[test]
    fn maybe_append_rejects_mismatch() {
        let mut log = log_with(&[1, 1]);
        let result = log
            .maybe_append(2, 5, 0, &[LogEntry::new(5, 3, vec![])])
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn maybe_append_truncates_conflict_and_commits() {
        let mut log = log_with(&[1, 1, 1]);
        let result = log
            .maybe_append(
                1,
                1,
                3,
                &[LogEntry::new(2, 2, b"new".to_vec()), LogEntry::new(2, 3, vec![])],
            )
            .unwrap();

        assert_eq!(result, Some(3));
        assert_eq!(log.term(2).unwrap(), 2);
        assert_eq!(log.committed(), 3);
    }

    #[test]
    fn maybe_append_rejects_misnumbered_entries() {
        let mut log = log_with(&[1, 1]);
        let gap = [LogEntry::new(1, 4, vec![])];
        assert_eq!(log.maybe_append(1, 1, 0, &gap).unwrap(), None);
        let holes = [LogEntry::new(1, 2, vec![]), LogEntry::new(1, 4, vec![])];
        assert_eq!(log.maybe_append(1, 1, 0, &holes).unwrap(), None);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn maybe_append_caps_commit_at_last_new_entry() {
        let mut log = log_with(&[1, 1, 1]);
        log.maybe_append(1, 1, 100, &[]).unwrap();
        // entries after 1 are not known to match the leader yet
        assert_eq!(log.committed(), 1);
    }

    #[test]
    fn truncating_committed_entries_is_an_invariant_violation() {
        let mut log = log_with(&[1, 1]);
        log.commit_to(2);
        let err = log
            .maybe_append(1, 1, 2, &[LogEntry::new(3, 2, vec![])])
            .unwrap_err();
        assert!(matches!(err, RaftError::Invariant(_)));
    }

    #[test]
    fn find_conflict_by_term_skips_higher_terms() {
        let log = log_with(&[1, 1, 3, 3, 3]);
        assert_eq!(log.find_conflict_by_term(5, 2), (2, 1));
        assert_eq!(log.find_conflict_by_term(5, 3), (5, 3));
        assert_eq!(log.find_conflict_by_term(5, 0), (0, 0));
    }

    #[test]
    fn commit_never_moves_backwards() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(3);
        log.commit_to(1);
        assert_eq!(log.committed(), 3);
    }

    #[test]
    fn maybe_commit_requires_matching_term() {
        let mut log = log_with(&[1, 2]);
        assert!(!log.maybe_commit(2, 1));
        assert!(log.maybe_commit(2, 2));
        assert_eq!(log.committed(), 2);
    }

    #[test]
    fn next_committed_hands_out_each_entry_once() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(2);
        assert_eq!(log.next_committed().unwrap().len(), 2);
        assert!(log.next_committed().unwrap().is_empty());
        log.commit_to(3);
        assert_eq!(log.next_committed().unwrap()[0].index, 3);
    }

    #[test]
    fn compaction_requires_applied_entries() {
        let mut log = log_with(&[1, 1, 1]);
        log.commit_to(3);
        let err = log.compact(2, vec![]).unwrap_err();
        assert!(matches!(
            err,
            RaftError::CompactBeyondApplied {
                index: 2,
                applied: 0
            }
        ));

        log.next_committed().unwrap();
        let snapshot = log.compact(2, b"state".to_vec()).unwrap();
        assert_eq!(snapshot.index, 2);
        assert_eq!(log.first_index(), 3);
        assert!(log.match_term(2, 1));
    }
}
