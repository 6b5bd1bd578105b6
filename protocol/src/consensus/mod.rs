//! # Consensus Module
//!
//! Raft over blocks: each replicated log entry carries exactly one block,
//! and an entry's commit is the block's finality.
//!
//! ## Architecture
//!
//! ```text
//! raft.rs  — RaftNode state machine: elections, replication, commit rule
//! log.rs   — RaftStorage backends (in-memory, sled)
//! ```
//!
//! The state machine has no I/O. [`crate::node`] owns a `RaftNode`, feeds
//! it ticks and peer messages, ships the `Send` actions over the mesh, and
//! runs `Apply` actions through [`crate::storage::Chain`].
//!
//! ## Design Decisions
//!
//! 1. **Log index is not block height.** Entries can be proposed for
//!    blocks that later fail to apply on a replica that is behind, and a
//!    replica may receive blocks by sync before it sees their entries.
//!    Application skips entries whose block is already in the chain.
//!
//! 2. **One commit path.** A one-voter cluster commits through the same
//!    majority check as a five-voter one.

pub mod log;
pub mod raft;

pub use log::{MemoryRaftLog, SledRaftLog};
pub use raft::{
    AppendEntries, AppendEntriesReply, HardState, LogEntry, NodeId, RaftAction, RaftConfig,
    RaftError, RaftMessage, RaftNode, RaftResult, RaftStorage, RequestVote, RequestVoteReply,
    Role,
};
