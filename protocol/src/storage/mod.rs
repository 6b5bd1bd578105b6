//! # Storage Module
//!
//! Everything a node persists, and the deterministic pipeline that turns
//! blocks into world state.
//!
//! ## Architecture
//!
//! ```text
//! block.rs     — Block structure, genesis, hash/Merkle/signature checks
//! state.rs     — World-state rows, copy-on-write overlay, state root
//! executor.rs  — Transaction semantics: state, ACL, contracts, governance
//! query.rs     — Read-only SQL subset over world_state
//! db.rs        — sled persistence, atomic block application, pending pool
//! chain.rs     — Tip tracking and linkage validation
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Block ──► Chain::append_block ──► LedgerDb::apply_block_atomically
//!                                      │
//!                                      ├─ Executor over StateOverlay
//!                                      ├─ state root == block.state_root?
//!                                      └─ one sled transaction
//! ```
//!
//! ## Design Decisions
//!
//! 1. **BLAKE3 for content.** Block hashes, Merkle roots and the state root
//!    are all BLAKE3.
//!
//! 2. **Row removal on delete.** A deleted key disappears from
//!    `world_state`; it doesn't leave a tombstone behind. The state root
//!    only ever covers live rows.
//!
//! 3. **Blocks are all-or-nothing.** A committed block whose transactions
//!    don't all execute is rejected as a whole. Leaders weed out failing
//!    transactions when they pack a block, so this only trips on a faulty
//!    proposer or a diverged replica.

pub mod block;
pub mod chain;
pub mod db;
pub mod executor;
pub mod query;
pub mod state;

pub use block::{Block, BlockError, BlockHeader};
pub use chain::{Chain, ChainError, ChainResult, ChainTip};
pub use db::{
    AppliedBlock, BlockLimits, LedgerDb, PendingEntry, Simulation, StorageError, StorageResult,
    StoredTransaction,
};
pub use executor::{AclHook, ExecutionError, Executor, StateWriteHook};
pub use query::QueryError;
pub use state::{StateOverlay, StateView, WorldStateEntry, WriteContext};
