//! # Block Structure
//!
//! A block is the unit that Raft replicates: every log entry carries exactly
//! one, and committing the entry is what finalizes the block.
//!
//! ## Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── height: u64                            │
//! │  ├── hash: [u8; 32]       (BLAKE3 of header)│
//! │  ├── previous_hash: [u8; 32]                │
//! │  ├── timestamp: u64       (ms)              │
//! │  ├── merkle_root: [u8; 32]                  │
//! │  ├── state_root: [u8; 32]                   │
//! │  ├── proposer: String     (hex public key)  │
//! │  └── signature: String    (hex, over hash)  │
//! ├─────────────────────────────────────────────┤
//! │  transactions: Vec<Transaction>             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! The block hash covers `height || previous_hash || timestamp ||
//! merkle_root || state_root || proposer`. The signature is not part of the
//! hash; it signs the hash.
//!
//! ## Merkle Root
//!
//! A binary Merkle tree over the ordered transaction hashes (see
//! [`crate::crypto::merkle_root`]). Empty blocks have an all-zero root.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{blake3_hash, hex_serde, merkle_root, Hash, ZERO_HASH};
use crate::crypto::keys::{NodeKeypair, PublicKey, Signature};
use crate::transaction::{verify_transaction, Transaction};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Why a block failed self-consistency checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block {height} hash mismatch: stored={stored}, computed={computed}")]
    HashMismatch {
        height: u64,
        stored: String,
        computed: String,
    },

    #[error("block {height} merkle root mismatch")]
    MerkleMismatch { height: u64 },

    #[error("genesis block must have height 0, a zero previous hash and no transactions")]
    MalformedGenesis,

    #[error("block {height} is unsigned")]
    MissingSignature { height: u64 },

    #[error("block {height} has an invalid proposer key")]
    InvalidProposer { height: u64 },

    #[error("block {height} signature does not verify against its proposer")]
    InvalidSignature { height: u64 },

    #[error("block {height} contains invalid transaction {hash}: {reason}")]
    InvalidTransaction {
        height: u64,
        hash: String,
        reason: String,
    },

    #[error("block {height} contains transaction {hash} twice")]
    DuplicateTransaction { height: u64, hash: String },
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// Everything except the transaction list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (genesis = 0).
    pub height: u64,

    /// BLAKE3 hash of the header fields listed in the module docs.
    #[serde(with = "hex_serde")]
    pub hash: Hash,

    /// Hash of the block at `height - 1`. All zeros for genesis.
    #[serde(with = "hex_serde")]
    pub previous_hash: Hash,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Merkle root over ordered transaction hashes.
    #[serde(with = "hex_serde")]
    pub merkle_root: Hash,

    /// World-state root after applying this block's transactions.
    #[serde(with = "hex_serde")]
    pub state_root: Hash,

    /// Hex public key of the proposing node. Empty for genesis.
    pub proposer: String,

    /// Hex signature over `hash`. Empty until signed; empty for genesis.
    pub signature: String,
}

impl BlockHeader {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A block: header plus ordered transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The deterministic genesis block.
    ///
    /// Height 0, zero previous hash, timestamp 0, no transactions, no
    /// proposer and the empty-state root. Every node derives the same one
    /// without talking to anybody.
    pub fn genesis() -> Self {
        let mut block = Block {
            header: BlockHeader {
                height: 0,
                hash: ZERO_HASH,
                previous_hash: ZERO_HASH,
                timestamp: 0,
                merkle_root: ZERO_HASH,
                state_root: ZERO_HASH,
                proposer: String::new(),
                signature: String::new(),
            },
            transactions: Vec::new(),
        };
        block.header.hash = block.compute_hash();
        block
    }

    /// Build an unsigned block. The hash and Merkle root are computed here;
    /// call [`sign`](Self::sign) before handing it to consensus.
    pub fn new(
        height: u64,
        previous_hash: Hash,
        timestamp: u64,
        transactions: Vec<Transaction>,
        proposer: String,
        state_root: Hash,
    ) -> Self {
        let mut block = Block {
            header: BlockHeader {
                height,
                hash: ZERO_HASH,
                previous_hash,
                timestamp,
                merkle_root: compute_merkle_root(&transactions),
                state_root,
                proposer,
                signature: String::new(),
            },
            transactions,
        };
        block.header.hash = block.compute_hash();
        block
    }

    /// Sign the block hash with the proposer's key.
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        self.header.signature = keypair.sign(&self.header.hash).to_hex();
    }

    /// Recompute the block hash from header fields.
    pub fn compute_hash(&self) -> Hash {
        let h = &self.header;
        let mut preimage = Vec::with_capacity(168 + h.proposer.len());
        preimage.extend_from_slice(&h.height.to_le_bytes());
        preimage.extend_from_slice(&h.previous_hash);
        preimage.extend_from_slice(&h.timestamp.to_le_bytes());
        preimage.extend_from_slice(&h.merkle_root);
        preimage.extend_from_slice(&h.state_root);
        preimage.extend_from_slice(h.proposer.as_bytes());
        blake3_hash(&preimage)
    }

    /// Verify block self-consistency.
    ///
    /// 1. Stored hash matches the recomputed hash.
    /// 2. Merkle root matches the transaction list.
    /// 3. Genesis shape, or a valid proposer signature for everything else.
    /// 4. Every transaction passes stateless verification, with no duplicates.
    ///
    /// Linkage to the previous block is the chain's job, not this one.
    pub fn verify(&self) -> Result<(), BlockError> {
        let height = self.header.height;

        let computed = self.compute_hash();
        if self.header.hash != computed {
            return Err(BlockError::HashMismatch {
                height,
                stored: self.header.hash_hex(),
                computed: hex::encode(computed),
            });
        }

        if self.header.merkle_root != compute_merkle_root(&self.transactions) {
            return Err(BlockError::MerkleMismatch { height });
        }

        if height == 0 {
            if self.header.previous_hash != ZERO_HASH || !self.transactions.is_empty() {
                return Err(BlockError::MalformedGenesis);
            }
            return Ok(());
        }

        if self.header.signature.is_empty() {
            return Err(BlockError::MissingSignature { height });
        }
        let proposer = PublicKey::from_hex(&self.header.proposer)
            .map_err(|_| BlockError::InvalidProposer { height })?;
        let signature = Signature::from_hex(&self.header.signature)
            .map_err(|_| BlockError::InvalidSignature { height })?;
        if !proposer.verify(&self.header.hash, &signature) {
            return Err(BlockError::InvalidSignature { height });
        }

        let mut seen = std::collections::HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !seen.insert(tx.hash.as_str()) {
                return Err(BlockError::DuplicateTransaction {
                    height,
                    hash: tx.hash.clone(),
                });
            }
            verify_transaction(tx).map_err(|e| BlockError::InvalidTransaction {
                height,
                hash: tx.hash.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn hash_hex(&self) -> String {
        self.header.hash_hex()
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

/// Merkle root over the ordered transaction hashes.
///
/// A transaction whose stored hash isn't valid hex still gets a leaf (the
/// BLAKE3 of its hash string), so the root is always defined; such a
/// transaction fails verification anyway.
pub fn compute_merkle_root(transactions: &[Transaction]) -> Hash {
    let leaves: Vec<Hash> = transactions
        .iter()
        .map(|tx| {
            tx.hash_bytes()
                .unwrap_or_else(|| blake3_hash(tx.hash.as_bytes()))
        })
        .collect();
    merkle_root(&leaves)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionBuilder, TransactionPayload};
    use serde_json::json;

    fn make_test_tx(kp: &NodeKeypair, nonce: u64) -> Transaction {
        TransactionBuilder::new(TransactionPayload::StateSet {
            key: format!("k{}", nonce),
            value: json!(nonce),
        })
        .nonce(nonce)
        .sign(kp)
    }

    fn signed_block(kp: &NodeKeypair, txs: Vec<Transaction>) -> Block {
        let genesis = Block::genesis();
        let mut block = Block::new(1, genesis.hash(), 1_000, txs, kp.public_key_hex(), ZERO_HASH);
        block.sign(kp);
        block
    }

    #[test]
    fn genesis_is_deterministic_and_valid() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a, b);
        assert_eq!(a.height(), 0);
        assert_eq!(a.header.previous_hash, ZERO_HASH);
        assert!(a.verify().is_ok());
    }

    #[test]
    fn signed_block_verifies() {
        let kp = NodeKeypair::generate();
        let block = signed_block(&kp, vec![make_test_tx(&kp, 0), make_test_tx(&kp, 1)]);
        assert_eq!(block.verify(), Ok(()));
        assert_eq!(block.tx_count(), 2);
    }

    #[test]
    fn tampered_block_fails_verification() {
        let kp = NodeKeypair::generate();
        let mut block = signed_block(&kp, vec![]);
        block.header.timestamp += 1;
        assert!(matches!(
            block.verify(),
            Err(BlockError::HashMismatch { .. })
        ));
    }

    #[test]
    fn swapped_transactions_fail_merkle_check() {
        let kp = NodeKeypair::generate();
        let mut block = signed_block(&kp, vec![make_test_tx(&kp, 0), make_test_tx(&kp, 1)]);
        block.transactions.swap(0, 1);
        assert_eq!(block.verify(), Err(BlockError::MerkleMismatch { height: 1 }));
    }

    #[test]
    fn unsigned_block_rejected() {
        let kp = NodeKeypair::generate();
        let block = Block::new(1, ZERO_HASH, 5, vec![], kp.public_key_hex(), ZERO_HASH);
        assert_eq!(
            block.verify(),
            Err(BlockError::MissingSignature { height: 1 })
        );
    }

    #[test]
    fn signature_by_someone_else_rejected() {
        let proposer = NodeKeypair::generate();
        let imposter = NodeKeypair::generate();
        let mut block = Block::new(1, ZERO_HASH, 5, vec![], proposer.public_key_hex(), ZERO_HASH);
        block.sign(&imposter);
        assert_eq!(
            block.verify(),
            Err(BlockError::InvalidSignature { height: 1 })
        );
    }

    #[test]
    fn duplicate_transaction_rejected() {
        let kp = NodeKeypair::generate();
        let tx = make_test_tx(&kp, 0);
        let block = signed_block(&kp, vec![tx.clone(), tx]);
        assert!(matches!(
            block.verify(),
            Err(BlockError::DuplicateTransaction { .. })
        ));
    }

    #[test]
    fn header_hashes_serialize_as_hex() {
        let block = Block::genesis();
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["header"]["previous_hash"], json!(hex::encode(ZERO_HASH)));
        let back: Block = serde_json::from_value(v).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn merkle_root_tracks_transaction_hashes() {
        let kp = NodeKeypair::generate();
        let txs = vec![make_test_tx(&kp, 0)];
        let leaf = txs[0].hash_bytes().unwrap();
        assert_eq!(compute_merkle_root(&txs), merkle_root(&[leaf]));
        assert_eq!(compute_merkle_root(&[]), ZERO_HASH);
    }
}
