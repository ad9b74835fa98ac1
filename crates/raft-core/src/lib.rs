//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: raft-storage persists it through the LogStore trait
//! what: step engine, progress tracking and flow control, commit calculation,
//! snapshot coordination, log-store interface
//!
//! The engine does no I/O of its own. A driver feeds it ticks, messages and
//! proposals, and drains outbound messages, committed entries and received
//! snapshots after each call.

/// Identifier of a cluster member
pub type NodeId = u64;
/// Election epoch
pub type Term = u64;
/// Position in the replicated log, 1-based
pub type Index = u64;

pub mod config;
pub mod error;
pub mod inflights;
pub mod log;
pub mod message;
pub mod node;
pub mod progress;
pub mod quorum;
mod replication;
pub mod status;
mod step;
pub mod storage;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::{HardState, LogEntry, RaftLog, Snapshot};
pub use message::{Message, MessageBody, MessageKind};
pub use node::{NodeState, RaftNode};
pub use progress::{Progress, ProgressState};
pub use quorum::{Configuration, VoteResult};
pub use status::Status;
pub use storage::{LogStore, MemoryLogStore, StorageError};
