//! # storage
//!
//! why: the engine never owns durable state directly, it talks to a log store
//! relations: wrapped by log.rs, implemented on disk by the raft-storage crate
//! what: LogStore trait, StorageError, MemoryLogStore

use crate::log::{HardState, LogEntry, Snapshot};
use crate::{Index, Term};
use thiserror::Error;

/// errors reported by a log store
///
/// `Compacted` is the one the engine is built around: it is never fatal and
/// always routes a follower onto the snapshot path.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("index {0} has been compacted away")]
    Compacted(Index),

    #[error("index {0} is beyond the last log index")]
    Unavailable(Index),

    #[error("snapshot at index {index} is older than the current one at {current}")]
    SnapshotOutOfDate { index: Index, current: Index },

    #[error("cannot compact to {index}: latest snapshot is at {snapshot}")]
    CompactBeyondSnapshot { index: Index, snapshot: Index },

    #[error("entry {got} does not follow last index {last}")]
    NonContiguous { got: Index, last: Index },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// trait for the replicated log and the hard state that goes with it
///
/// this abstraction allows the same engine to work with:
/// - in-memory logs (tests, simulations)
/// - file-backed logs (raft-storage)
///
/// every mutation must be durable when the call returns; the engine relies on
/// that to keep its write-ahead ordering.
pub trait LogStore {
    /// the last persisted term, vote and commit index
    fn hard_state(&self) -> HardState;

    /// persist term, vote and commit index
    fn set_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError>;

    /// index of the first retained entry (retained floor + 1)
    fn first_index(&self) -> Index;

    /// index of the last entry, or the retained floor when no entry is left
    fn last_index(&self) -> Index;

    /// term of the entry at `index`
    ///
    /// the retained floor still answers with its term so that appends right
    /// after a compaction can be matched.
    fn term_at(&self, index: Index) -> Result<Term, StorageError>;

    /// up to `max` entries starting at `index`
    fn entries_from(&self, index: Index, max: usize) -> Result<Vec<LogEntry>, StorageError>;

    /// append entries, replacing any existing suffix from `entries[0].index`
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// record a snapshot of the application state as of `index`
    fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<Snapshot, StorageError>;

    /// discard entries at or below `index`, keeping its term for matching
    fn compact_to(&mut self, index: Index) -> Result<(), StorageError>;

    /// the latest snapshot
    fn snapshot(&self) -> Result<Snapshot, StorageError>;

    /// replace the whole log with a snapshot received from a leader
    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;
}

// -- in-memory implementation --

/// in-memory log store
///
/// keeps the retained floor (`floor_index`, `floor_term`) separately from the
/// latest snapshot so that a snapshot can be taken before compacting.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    hard_state: HardState,
    snapshot: Snapshot,
    floor_index: Index,
    floor_term: Term,
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    /// create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// rebuild a store from previously persisted parts
    pub fn from_parts(
        hard_state: HardState,
        snapshot: Snapshot,
        floor: (Index, Term),
        entries: Vec<LogEntry>,
    ) -> Result<Self, StorageError> {
        let (floor_index, floor_term) = floor;
        for (offset, entry) in entries.iter().enumerate() {
            let expected = floor_index + 1 + offset as Index;
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    got: entry.index,
                    last: expected - 1,
                });
            }
        }
        Ok(Self {
            hard_state,
            snapshot,
            floor_index,
            floor_term,
            entries,
        })
    }

    /// the retained floor as `(index, term)`
    pub fn floor(&self) -> (Index, Term) {
        (self.floor_index, self.floor_term)
    }

    /// every retained entry
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    fn offset(&self, index: Index) -> usize {
        (index - self.floor_index - 1) as usize
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn set_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError> {
        self.hard_state = hard_state;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.floor_index + 1
    }

    fn last_index(&self) -> Index {
        self.floor_index + self.entries.len() as Index
    }

    fn term_at(&self, index: Index) -> Result<Term, StorageError> {
        if index < self.floor_index {
            return Err(StorageError::Compacted(index));
        }
        if index == self.floor_index {
            return Ok(self.floor_term);
        }
        if index > self.last_index() {
            return Err(StorageError::Unavailable(index));
        }
        Ok(self.entries[self.offset(index)].term)
    }

    fn entries_from(&self, index: Index, max: usize) -> Result<Vec<LogEntry>, StorageError> {
        if index <= self.floor_index {
            return Err(StorageError::Compacted(index));
        }
        if index > self.last_index() + 1 {
            return Err(StorageError::Unavailable(index));
        }
        let start = self.offset(index);
        let end = start.saturating_add(max).min(self.entries.len());
        Ok(self.entries[start..end].to_vec())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let last = self.last_index();
        if first.index > last + 1 {
            return Err(StorageError::NonContiguous {
                got: first.index,
                last,
            });
        }

        // entries at or below the floor are already part of the snapshot
        let skip = self.floor_index.saturating_sub(first.index - 1) as usize;
        let entries = entries.get(skip..).unwrap_or_default();
        let Some(first) = entries.first() else {
            return Ok(());
        };

        self.entries.truncate(self.offset(first.index));
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn create_snapshot(&mut self, index: Index, data: Vec<u8>) -> Result<Snapshot, StorageError> {
        if index <= self.snapshot.index {
            return Err(StorageError::SnapshotOutOfDate {
                index,
                current: self.snapshot.index,
            });
        }
        let term = self.term_at(index)?;
        self.snapshot = Snapshot { index, term, data };
        Ok(self.snapshot.clone())
    }

    fn compact_to(&mut self, index: Index) -> Result<(), StorageError> {
        if index <= self.floor_index {
            return Err(StorageError::Compacted(index));
        }
        if index > self.snapshot.index {
            return Err(StorageError::CompactBeyondSnapshot {
                index,
                snapshot: self.snapshot.index,
            });
        }
        let term = self.term_at(index)?;
        let drain = self.offset(index) + 1;
        self.entries.drain(..drain);
        self.floor_index = index;
        self.floor_term = term;
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        if snapshot.index <= self.snapshot.index {
            return Err(StorageError::SnapshotOutOfDate {
                index: snapshot.index,
                current: self.snapshot.index,
            });
        }
        self.floor_index = snapshot.index;
        self.floor_term = snapshot.term;
        self.entries.clear();
        if self.hard_state.commit < snapshot.index {
            self.hard_state.commit = snapshot.index;
        }
        self.snapshot = snapshot;
        Ok(())
    }
}
