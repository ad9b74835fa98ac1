//! # error
//!
//! why: give callers one error type for everything the engine can report
//! relations: wraps storage.rs errors, returned by every driver entry point
//! what: RaftError, Result alias

use crate::storage::StorageError;
use crate::{Index, NodeId};
use thiserror::Error;

/// Result type for raft operations.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors surfaced to the driver.
///
/// Protocol conditions (stale terms, log mismatches, compacted indices, lost
/// messages) are handled inside the engine and never show up here.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The log store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Proposal rejected; the caller must resubmit to the leader.
    #[error("node {id} is not the leader (leader: {leader:?})")]
    NotLeader { id: NodeId, leader: Option<NodeId> },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Compaction asked for entries the application has not applied yet.
    #[error("cannot compact to {index}: only applied up to {applied}")]
    CompactBeyondApplied { index: Index, applied: Index },

    /// The caller broke the engine's contract (e.g. durable state written out
    /// of order).
    #[error("invariant violated: {0}")]
    Invariant(String),
}
