//! # Chain
//!
//! The canonical block sequence as the rest of the node sees it. `Chain`
//! holds only the tip (height, hash, timestamp); full blocks stay in
//! [`LedgerDb`] and are fetched by height or hash when someone needs them.
//!
//! Appending is where linkage is enforced: a block must sit exactly one
//! above the tip, point at the tip's hash, and pass its own self-checks
//! before storage is asked to apply it.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::block::{Block, BlockError};
use super::db::{AppliedBlock, LedgerDb, StorageError};
use crate::crypto::hash::Hash;
use crate::transaction::Transaction;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("height mismatch: expected {expected}, got {actual}")]
    HeightMismatch { expected: u64, actual: u64 },

    #[error("block {height} does not link to the tip: previous_hash={actual}, tip={expected}")]
    PreviousHashMismatch {
        height: u64,
        expected: String,
        actual: String,
    },

    #[error("block {0} is already part of the chain")]
    AlreadyApplied(u64),

    #[error(transparent)]
    InvalidBlock(#[from] BlockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ChainError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_fatal())
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Lightweight reference to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash,
    pub timestamp: u64,
}

impl ChainTip {
    pub fn of(block: &Block) -> Self {
        Self {
            height: block.height(),
            hash: block.hash(),
            timestamp: block.header.timestamp,
        }
    }
}

#[derive(Debug)]
pub struct Chain {
    db: Arc<LedgerDb>,
    tip: ChainTip,
}

impl Chain {
    /// Load the tip from storage.
    pub fn load(db: Arc<LedgerDb>) -> ChainResult<Self> {
        let tip = ChainTip::of(&db.latest_block()?);
        debug!(height = tip.height, "chain loaded");
        Ok(Self { db, tip })
    }

    pub fn height(&self) -> u64 {
        self.tip.height
    }

    pub fn tip(&self) -> ChainTip {
        self.tip
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    /// Unsigned candidate on top of the current tip. Not persisted.
    pub fn propose_block(
        &self,
        transactions: Vec<Transaction>,
        proposer: String,
        state_root: Hash,
    ) -> Block {
        self.propose_block_on(self.tip, transactions, proposer, state_root)
    }

    /// Unsigned candidate on top of `parent`, which may be a block that is
    /// proposed but not yet committed.
    pub fn propose_block_on(
        &self,
        parent: ChainTip,
        transactions: Vec<Transaction>,
        proposer: String,
        state_root: Hash,
    ) -> Block {
        let timestamp = Self::next_timestamp(&parent);
        Self::assemble(parent, timestamp, transactions, proposer, state_root)
    }

    /// Timestamp for a child of `parent`: now, but never earlier than the
    /// parent even if the local clock runs backwards.
    pub fn next_timestamp(parent: &ChainTip) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        now.max(parent.timestamp)
    }

    /// Unsigned candidate with a caller-chosen timestamp. Used when the
    /// state root was computed for that exact timestamp.
    pub fn assemble(
        parent: ChainTip,
        timestamp: u64,
        transactions: Vec<Transaction>,
        proposer: String,
        state_root: Hash,
    ) -> Block {
        Block::new(
            parent.height + 1,
            parent.hash,
            timestamp,
            transactions,
            proposer,
            state_root,
        )
    }

    /// Validate linkage and contents, apply through storage, advance the
    /// tip.
    pub fn append_block(&mut self, block: &Block) -> ChainResult<AppliedBlock> {
        let height = block.height();
        if height <= self.tip.height {
            if let Some(existing) = self.db.get_block(height)? {
                if existing.hash() == block.hash() {
                    return Err(ChainError::AlreadyApplied(height));
                }
            }
        }
        if height != self.tip.height + 1 {
            return Err(ChainError::HeightMismatch {
                expected: self.tip.height + 1,
                actual: height,
            });
        }
        if block.header.previous_hash != self.tip.hash {
            return Err(ChainError::PreviousHashMismatch {
                height,
                expected: hex::encode(self.tip.hash),
                actual: hex::encode(block.header.previous_hash),
            });
        }
        block.verify()?;

        let applied = self.db.apply_block_atomically(block)?;
        self.tip = ChainTip::of(block);
        Ok(applied)
    }

    /// Re-read the tip from storage, e.g. after another writer advanced it.
    pub fn reload(&mut self) -> ChainResult<()> {
        self.tip = ChainTip::of(&self.db.latest_block()?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::storage::db::BlockLimits;
    use crate::transaction::{TransactionBuilder, TransactionPayload};
    use serde_json::json;

    const LIMITS: BlockLimits = BlockLimits {
        max_transactions: 100,
        max_bytes: 1 << 20,
    };

    fn setup() -> (Chain, NodeKeypair) {
        let db = Arc::new(LedgerDb::open_temporary().unwrap());
        (Chain::load(db).unwrap(), NodeKeypair::generate())
    }

    fn signed_next(chain: &Chain, node: &NodeKeypair, txs: Vec<Transaction>) -> Block {
        let tip = chain.tip();
        let sim = chain
            .db()
            .simulate(&[], &txs, tip.height + 1, tip.timestamp + 1, LIMITS)
            .unwrap();
        let mut block = chain.propose_block(sim.included, node.public_key_hex(), sim.state_root);
        block.sign(node);
        block
    }

    #[test]
    fn starts_at_genesis() {
        let (chain, _) = setup();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip().hash, Block::genesis().hash());
    }

    #[test]
    fn proposal_links_to_tip_and_is_unsigned() {
        let (chain, node) = setup();
        let block = chain.propose_block(vec![], node.public_key_hex(), [0u8; 32]);
        assert_eq!(block.height(), 1);
        assert_eq!(block.header.previous_hash, chain.tip().hash);
        assert!(block.header.signature.is_empty());
        // Nothing was persisted.
        assert_eq!(chain.db().latest_height().unwrap(), 0);
    }

    #[test]
    fn append_advances_tip() {
        let (mut chain, node) = setup();
        let user = NodeKeypair::generate();
        let tx = TransactionBuilder::new(TransactionPayload::StateSet {
            key: "a".into(),
            value: json!("1"),
        })
        .nonce(0)
        .sign(&user);

        let block = signed_next(&chain, &node, vec![tx]);
        let applied = chain.append_block(&block).unwrap();
        assert_eq!(applied.height, 1);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().hash, block.hash());
    }

    #[test]
    fn rejects_gap_and_bad_linkage() {
        let (mut chain, node) = setup();
        let mut gap = Block::new(2, chain.tip().hash, 1, vec![], node.public_key_hex(), [0u8; 32]);
        gap.sign(&node);
        assert!(matches!(
            chain.append_block(&gap),
            Err(ChainError::HeightMismatch {
                expected: 1,
                actual: 2
            })
        ));

        let mut forked = Block::new(1, [9u8; 32], 1, vec![], node.public_key_hex(), [0u8; 32]);
        forked.sign(&node);
        assert!(matches!(
            chain.append_block(&forked),
            Err(ChainError::PreviousHashMismatch { .. })
        ));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn rejects_unsigned_block() {
        let (mut chain, node) = setup();
        let block = chain.propose_block(vec![], node.public_key_hex(), [0u8; 32]);
        assert!(matches!(
            chain.append_block(&block),
            Err(ChainError::InvalidBlock(BlockError::MissingSignature { .. }))
        ));
    }

    #[test]
    fn duplicate_append_is_reported_not_applied() {
        let (mut chain, node) = setup();
        let block = signed_next(&chain, &node, vec![]);
        chain.append_block(&block).unwrap();
        assert!(matches!(
            chain.append_block(&block),
            Err(ChainError::AlreadyApplied(1))
        ));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn proposal_timestamp_never_precedes_parent() {
        let (chain, node) = setup();
        let future_parent = ChainTip {
            height: 0,
            hash: chain.tip().hash,
            timestamp: u64::MAX / 2,
        };
        let block = chain.propose_block_on(future_parent, vec![], node.public_key_hex(), [0u8; 32]);
        assert_eq!(block.header.timestamp, u64::MAX / 2);
    }
}
