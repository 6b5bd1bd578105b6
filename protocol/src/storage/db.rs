//! # LedgerDb — Persistent Storage Engine
//!
//! The single source of truth for everything a node persists, built on
//! sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                  | Value                         |
//! |----------------|----------------------|-------------------------------|
//! | `blocks`       | `height` (8B BE)     | `json(Block)`                 |
//! | `block_hashes` | `hash` (32B)         | `height` (8B BE)              |
//! | `transactions` | tx hash (hex UTF-8)  | `json(StoredTransaction)`     |
//! | `rejected`     | tx hash (hex UTF-8)  | reason (UTF-8)                |
//! | `world_state`  | key (UTF-8)          | `json(WorldStateEntry)`       |
//! | `pending`      | tx hash (hex UTF-8)  | `json(PendingEntry)`          |
//! | `nonces`       | sender (hex UTF-8)   | next nonce (8B BE)            |
//! | `metadata`     | name (UTF-8)         | bytes                         |
//!
//! The Raft log and hard state live in their own trees owned by
//! [`crate::consensus::SledRaftLog`].
//!
//! Block heights are big-endian so that sled's lexicographic ordering
//! matches numeric ordering and range scans just work.
//!
//! ## Design Decisions
//!
//! 1. **JSON on disk.** World-state values are arbitrary JSON, and bincode
//!    can't round-trip `serde_json::Value`. One encoding for every tree keeps
//!    the layout inspectable with nothing more than `sled` and `jq`.
//!
//! 2. **Execute, then commit.** A block is executed against a
//!    [`StateOverlay`] first. Only if every transaction succeeds and the
//!    resulting root equals `block.state_root` does a single multi-tree sled
//!    transaction write the block, its transactions, the state diff, the
//!    nonces and the pending-pool removals. Either all of it lands or none
//!    of it does.
//!
//! 3. **One writer, many readers.** Writers serialize on an internal mutex.
//!    Readers never take it; sled's reads are lock-free.
//!
//! 4. **Fatal means fatal.** An I/O or corruption error during a write flips
//!    a sticky `halted` flag. From then on every write returns
//!    [`StorageError::Halted`] so the node can't drift into a state root its
//!    peers don't share.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::block::Block;
use super::executor::{ExecutionError, Executor};
use super::query::{self, QueryError};
use super::state::{self, StateOverlay, StateView, WorldStateEntry};
use crate::crypto::hash::Hash;
use crate::transaction::{Transaction, TransactionStatus};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("storage halted after a fatal error; refusing writes")]
    Halted,

    #[error("block {height} rejected: {reason}")]
    BlockRejected { height: u64, reason: String },

    #[error("state root mismatch at height {height}: block={expected}, computed={computed}")]
    StateRootMismatch {
        height: u64,
        expected: String,
        computed: String,
    },
}

impl StorageError {
    /// Errors after which the store must stop accepting writes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Sled(_) | Self::Corruption(_) | Self::Halted)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

const META_LATEST_HEIGHT: &[u8] = b"latest_block_height";

/// A confirmed transaction and where it landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub block_height: u64,
    /// Position inside the block.
    pub index: u32,
    pub transaction: Transaction,
}

/// A transaction waiting in the pending pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub transaction: Transaction,
    /// Arrival order. Breaks ties between equal nonces.
    pub received_seq: u64,
}

/// What a successful block application did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBlock {
    pub height: u64,
    pub hash: Hash,
    pub state_root: Hash,
    /// Confirmed transaction hashes, in block order.
    pub confirmed: Vec<String>,
}

/// Outcome of dry-running candidate transactions for a block proposal.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    /// Transactions that executed cleanly, in execution order.
    pub included: Vec<Transaction>,
    /// Transactions that can never succeed, with the reason.
    pub rejected: Vec<(Transaction, String)>,
    /// Transactions left in the pool for a later block (future nonce or
    /// block full).
    pub deferred: usize,
    /// World-state root after `included`.
    pub state_root: Hash,
}

/// Caps applied while packing a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockLimits {
    pub max_transactions: usize,
    pub max_bytes: usize,
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn decode_u64(bytes: &[u8]) -> StorageResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corruption(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corruption(e.to_string()))
}

// ---------------------------------------------------------------------------
// LedgerDb
// ---------------------------------------------------------------------------

/// Persistent storage engine.
///
/// Share it as `Arc<LedgerDb>`. All methods take `&self`.
pub struct LedgerDb {
    db: Db,
    blocks: Tree,
    block_hashes: Tree,
    transactions: Tree,
    rejected: Tree,
    world_state: Tree,
    pending: Tree,
    nonces: Tree,
    metadata: Tree,
    executor: Executor,
    write_lock: Mutex<()>,
    halted: AtomicBool,
}

impl std::fmt::Debug for LedgerDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerDb")
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

impl LedgerDb {
    /// Open or create a database at `path`. A fresh database gets the
    /// genesis block.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database, removed when dropped. For tests and
    /// ephemeral nodes.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let store = Self {
            blocks: db.open_tree("blocks")?,
            block_hashes: db.open_tree("block_hashes")?,
            transactions: db.open_tree("transactions")?,
            rejected: db.open_tree("rejected")?,
            world_state: db.open_tree("world_state")?,
            pending: db.open_tree("pending")?,
            nonces: db.open_tree("nonces")?,
            metadata: db.open_tree("metadata")?,
            executor: Executor::default(),
            write_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
            db,
        };
        store.ensure_genesis()?;
        Ok(store)
    }

    /// Replace the transaction executor (custom hooks or contract runtime).
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Open an auxiliary tree in the same database.
    pub(crate) fn open_tree(&self, name: &str) -> StorageResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    fn ensure_genesis(&self) -> StorageResult<()> {
        if self.metadata.get(META_LATEST_HEIGHT)?.is_some() {
            return Ok(());
        }
        let genesis = Block::genesis();
        let bytes = encode(&genesis)?;
        let result: Result<(), TransactionError<()>> =
            (&self.blocks, &self.block_hashes, &self.metadata).transaction(
                |(blocks, hashes, meta)| {
                    blocks.insert(&height_key(0)[..], bytes.as_slice())?;
                    hashes.insert(&genesis.header.hash[..], &height_key(0)[..])?;
                    meta.insert(META_LATEST_HEIGHT, &height_key(0)[..])?;
                    Ok::<(), ConflictableTransactionError<()>>(())
                },
            );
        result.map_err(tx_error)?;
        self.db.flush()?;
        info!(hash = %genesis.hash_hex(), "wrote genesis block");
        Ok(())
    }

    // -- Health --------------------------------------------------------------

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Refuse all further writes.
    pub fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(reason, "storage halted");
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.is_halted() {
            Err(StorageError::Halted)
        } else {
            Ok(())
        }
    }

    /// Halt on fatal errors, then pass the error through.
    fn escalate<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.halt(&e.to_string());
            }
        }
        result
    }

    // -- Blocks --------------------------------------------------------------

    pub fn latest_height(&self) -> StorageResult<u64> {
        match self.metadata.get(META_LATEST_HEIGHT)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn get_block(&self, height: u64) -> StorageResult<Option<Block>> {
        match self.blocks.get(height_key(height))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_block(&self) -> StorageResult<Block> {
        let height = self.latest_height()?;
        self.get_block(height)?
            .ok_or_else(|| StorageError::Corruption(format!("latest block {} missing", height)))
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        match self.block_hashes.get(hash)? {
            Some(height) => self.get_block(decode_u64(&height)?),
            None => Ok(None),
        }
    }

    /// Blocks in `start..=end`, stopping early at the first gap.
    pub fn get_block_range(&self, start: u64, end: u64) -> StorageResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for item in self.blocks.range(height_key(start)..=height_key(end)) {
            let (_, bytes) = item?;
            blocks.push(decode(&bytes)?);
        }
        Ok(blocks)
    }

    /// Apply a block: execute it, check its state root, and persist
    /// everything in one atomic write.
    ///
    /// Re-applying the block already stored at that height is a no-op that
    /// returns the original result with no confirmations.
    pub fn apply_block_atomically(&self, block: &Block) -> StorageResult<AppliedBlock> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let result = self.apply_locked(block);
        self.escalate(result)
    }

    fn apply_locked(&self, block: &Block) -> StorageResult<AppliedBlock> {
        let height = block.height();
        let latest = self.latest_height()?;

        if height <= latest {
            let stored = self.get_block(height)?;
            return match stored {
                Some(existing) if existing.hash() == block.hash() => {
                    debug!(height, "block already applied");
                    Ok(AppliedBlock {
                        height,
                        hash: existing.hash(),
                        state_root: existing.header.state_root,
                        confirmed: Vec::new(),
                    })
                }
                _ => Err(StorageError::BlockRejected {
                    height,
                    reason: format!("conflicts with stored block at height {}", height),
                }),
            };
        }
        if height != latest + 1 {
            return Err(StorageError::BlockRejected {
                height,
                reason: format!("expected height {}", latest + 1),
            });
        }

        let mut overlay = StateOverlay::new(self);
        for tx in &block.transactions {
            match self
                .executor
                .replay(&mut overlay, tx, height, block.header.timestamp)
            {
                Ok(()) => {}
                Err(ExecutionError::Storage(e)) => return Err(e),
                Err(e) => {
                    return Err(StorageError::BlockRejected {
                        height,
                        reason: format!("transaction {}: {}", tx.hash, e),
                    })
                }
            }
        }

        let computed = overlay.state_root()?;
        if computed != block.header.state_root {
            return Err(StorageError::StateRootMismatch {
                height,
                expected: hex::encode(block.header.state_root),
                computed: hex::encode(computed),
            });
        }

        // Serialize everything up front; the sled closure may run more than
        // once and must not fail on encoding.
        let block_bytes = encode(block)?;
        let mut tx_rows = Vec::with_capacity(block.transactions.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            let stored = StoredTransaction {
                block_height: height,
                index: index as u32,
                transaction: tx.clone(),
            };
            tx_rows.push((tx.hash.clone(), encode(&stored)?));
        }
        let mut state_rows = Vec::with_capacity(overlay.changes().len());
        for (key, change) in overlay.changes() {
            let bytes = match change {
                Some(entry) => Some(encode(entry)?),
                None => None,
            };
            state_rows.push((key.clone(), bytes));
        }
        let nonce_rows: Vec<(String, [u8; 8])> = overlay
            .nonces()
            .iter()
            .map(|(sender, next)| (sender.clone(), next.to_be_bytes()))
            .collect();
        let hash = block.hash();

        let result: Result<(), TransactionError<()>> = (
            &self.blocks,
            &self.block_hashes,
            &self.transactions,
            &self.world_state,
            &self.pending,
            &self.nonces,
            &self.metadata,
        )
            .transaction(|(blocks, hashes, txs, world, pending, nonces, meta)| {
                blocks.insert(&height_key(height)[..], block_bytes.as_slice())?;
                hashes.insert(&hash[..], &height_key(height)[..])?;
                for (tx_hash, bytes) in &tx_rows {
                    txs.insert(tx_hash.as_bytes(), bytes.as_slice())?;
                    pending.remove(tx_hash.as_bytes())?;
                }
                for (key, bytes) in &state_rows {
                    match bytes {
                        Some(bytes) => {
                            world.insert(key.as_bytes(), bytes.as_slice())?;
                        }
                        None => {
                            world.remove(key.as_bytes())?;
                        }
                    }
                }
                for (sender, next) in &nonce_rows {
                    nonces.insert(sender.as_bytes(), &next[..])?;
                }
                meta.insert(META_LATEST_HEIGHT, &height_key(height)[..])?;
                Ok::<(), ConflictableTransactionError<()>>(())
            });
        result.map_err(tx_error)?;
        self.db.flush()?;

        info!(
            height,
            hash = %hex::encode(hash),
            txs = block.tx_count(),
            state_root = %hex::encode(computed),
            "block applied"
        );

        Ok(AppliedBlock {
            height,
            hash,
            state_root: computed,
            confirmed: block.transactions.iter().map(|t| t.hash.clone()).collect(),
        })
    }

    /// Dry-run `candidates` on top of committed state plus `ancestors`
    /// (blocks proposed but not yet committed), the way a leader packs a
    /// block.
    ///
    /// Candidates should arrive in pool order (nonce, then arrival). A
    /// candidate whose nonce is ahead of its sender's next nonce is deferred;
    /// one whose nonce is behind, or whose execution fails, is rejected.
    pub fn simulate(
        &self,
        ancestors: &[Block],
        candidates: &[Transaction],
        height: u64,
        timestamp: u64,
        limits: BlockLimits,
    ) -> StorageResult<Simulation> {
        let mut overlay = StateOverlay::new(self);
        for ancestor in ancestors {
            for tx in &ancestor.transactions {
                match self.executor.replay(
                    &mut overlay,
                    tx,
                    ancestor.height(),
                    ancestor.header.timestamp,
                ) {
                    Ok(()) => {}
                    Err(ExecutionError::Storage(e)) => return self.escalate(Err(e)),
                    Err(e) => {
                        return Err(StorageError::BlockRejected {
                            height: ancestor.height(),
                            reason: format!("transaction {}: {}", tx.hash, e),
                        })
                    }
                }
            }
        }

        let mut sim = Simulation::default();
        let mut bytes_used = 0usize;
        for tx in candidates {
            let next = overlay.next_nonce(&tx.sender)?;
            if tx.nonce > next {
                sim.deferred += 1;
                continue;
            }
            if tx.nonce < next {
                let reason = format!("nonce {} already used (next is {})", tx.nonce, next);
                sim.rejected.push((tx.clone(), reason));
                continue;
            }
            let size = tx.size_bytes();
            if sim.included.len() >= limits.max_transactions
                || bytes_used + size > limits.max_bytes
            {
                sim.deferred += 1;
                continue;
            }
            match self.executor.execute(&mut overlay, tx, height, timestamp) {
                Ok(()) => {
                    bytes_used += size;
                    sim.included.push(tx.clone());
                }
                Err(ExecutionError::Storage(e)) => return self.escalate(Err(e)),
                Err(e) => sim.rejected.push((tx.clone(), e.to_string())),
            }
        }
        sim.state_root = overlay.state_root()?;
        Ok(sim)
    }

    // -- World state ---------------------------------------------------------

    pub fn get_state(&self, key: &str) -> StorageResult<Option<WorldStateEntry>> {
        self.get_entry(key)
    }

    /// Deterministic root over the full world state. Read-only.
    pub fn compute_state_root(&self) -> StorageResult<Hash> {
        state::compute_state_root(self.entries())
    }

    /// Run a read-only query against `world_state`.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Map<String, Value>>, QueryError> {
        let statement = query::parse(sql, params)?;
        statement.execute(self.entries())
    }

    pub fn get_next_nonce(&self, sender: &str) -> StorageResult<u64> {
        self.next_nonce(sender)
    }

    /// Force a sender's next nonce. Block application keeps nonces in step
    /// on its own; this is for repair and tests.
    pub fn update_nonce(&self, sender: &str, next: u64) -> StorageResult<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let result = self
            .nonces
            .insert(sender.as_bytes(), &next.to_be_bytes()[..])
            .map(|_| ())
            .map_err(StorageError::from);
        self.escalate(result)
    }

    // -- Transactions --------------------------------------------------------

    pub fn get_transaction(&self, hash: &str) -> StorageResult<Option<StoredTransaction>> {
        match self.transactions.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn transaction_status(&self, hash: &str) -> StorageResult<Option<TransactionStatus>> {
        if let Some(stored) = self.get_transaction(hash)? {
            return Ok(Some(TransactionStatus::Confirmed {
                block_height: stored.block_height,
            }));
        }
        if self.pending.contains_key(hash.as_bytes())? {
            return Ok(Some(TransactionStatus::Pending));
        }
        match self.rejected.get(hash.as_bytes())? {
            Some(reason) => Ok(Some(TransactionStatus::Rejected {
                reason: String::from_utf8_lossy(&reason).into_owned(),
            })),
            None => Ok(None),
        }
    }

    // -- Pending pool --------------------------------------------------------

    /// Add a transaction to the pool. Returns `false` if it's already
    /// pooled or confirmed.
    pub fn add_pending(&self, tx: &Transaction) -> StorageResult<bool> {
        self.check_writable()?;
        let key = tx.hash.as_bytes();
        if self.pending.contains_key(key)? || self.transactions.contains_key(key)? {
            return Ok(false);
        }
        let entry = PendingEntry {
            transaction: tx.clone(),
            received_seq: self.db.generate_id()?,
        };
        let bytes = encode(&entry)?;
        let _guard = self.write_lock.lock();
        let result = (|| -> StorageResult<()> {
            self.pending.insert(key, bytes)?;
            // A rejected hash that comes back gets a fresh chance.
            self.rejected.remove(key)?;
            Ok(())
        })();
        self.escalate(result)?;
        Ok(true)
    }

    pub fn remove_pending(&self, hash: &str) -> StorageResult<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let result = self
            .pending
            .remove(hash.as_bytes())
            .map(|old| old.is_some())
            .map_err(StorageError::from);
        self.escalate(result)
    }

    /// Remove from the pool and remember why.
    pub fn reject_transaction(&self, hash: &str, reason: &str) -> StorageResult<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock();
        let result: Result<(), TransactionError<()>> =
            (&self.pending, &self.rejected).transaction(|(pending, rejected)| {
                pending.remove(hash.as_bytes())?;
                rejected.insert(hash.as_bytes(), reason.as_bytes())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            });
        let result = result.map_err(tx_error);
        if result.is_ok() {
            warn!(tx = hash, reason, "transaction rejected");
        }
        self.escalate(result)
    }

    pub fn contains_pending(&self, hash: &str) -> StorageResult<bool> {
        Ok(self.pending.contains_key(hash.as_bytes())?)
    }

    pub fn get_pending(&self, hash: &str) -> StorageResult<Option<Transaction>> {
        match self.pending.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode::<PendingEntry>(&bytes)?.transaction)),
            None => Ok(None),
        }
    }

    /// The pool in proposal order: nonce ascending, then arrival.
    pub fn pending_transactions(&self) -> StorageResult<Vec<Transaction>> {
        let mut entries = Vec::new();
        for item in self.pending.iter() {
            let (_, bytes) = item?;
            entries.push(decode::<PendingEntry>(&bytes)?);
        }
        entries.sort_by_key(|e| (e.transaction.nonce, e.received_seq));
        Ok(entries.into_iter().map(|e| e.transaction).collect())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the pool already holds a transaction from `sender` with
    /// `nonce`.
    pub fn pending_has_nonce(&self, sender: &str, nonce: u64) -> StorageResult<bool> {
        for item in self.pending.iter() {
            let (_, bytes) = item?;
            let entry: PendingEntry = decode(&bytes)?;
            if entry.transaction.sender == sender && entry.transaction.nonce == nonce {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn tx_error(err: TransactionError<()>) -> StorageError {
    match err {
        TransactionError::Storage(e) => StorageError::Sled(e),
        TransactionError::Abort(()) => StorageError::Corruption("transaction aborted".into()),
    }
}

// ---------------------------------------------------------------------------
// StateView
// ---------------------------------------------------------------------------

impl StateView for LedgerDb {
    fn get_entry(&self, key: &str) -> StorageResult<Option<WorldStateEntry>> {
        match self.world_state.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| state::corrupt_row(key.as_bytes(), e)),
            None => Ok(None),
        }
    }

    fn next_nonce(&self, sender: &str) -> StorageResult<u64> {
        match self.nonces.get(sender.as_bytes())? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn entries(&self) -> Box<dyn Iterator<Item = StorageResult<WorldStateEntry>> + '_> {
        Box::new(self.world_state.iter().map(|item| {
            let (key, bytes) = item?;
            serde_json::from_slice(&bytes).map_err(|e| state::corrupt_row(&key, e))
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::ZERO_HASH;
    use crate::crypto::keys::NodeKeypair;
    use crate::transaction::{TransactionBuilder, TransactionPayload};
    use serde_json::json;

    const LIMITS: BlockLimits = BlockLimits {
        max_transactions: 100,
        max_bytes: 1 << 20,
    };

    fn set_tx(kp: &NodeKeypair, nonce: u64, key: &str, value: Value) -> Transaction {
        TransactionBuilder::new(TransactionPayload::StateSet {
            key: key.into(),
            value,
        })
        .nonce(nonce)
        .timestamp(1_000 + nonce)
        .sign(kp)
    }

    /// Build and sign the next block from `txs`, the way a leader would.
    fn next_block(db: &LedgerDb, proposer: &NodeKeypair, txs: Vec<Transaction>) -> Block {
        let tip = db.latest_block().unwrap();
        let height = tip.height() + 1;
        let sim = db.simulate(&[], &txs, height, 5_000 + height, LIMITS).unwrap();
        assert!(sim.rejected.is_empty(), "unexpected rejections: {:?}", sim.rejected);
        let mut block = Block::new(
            height,
            tip.hash(),
            5_000 + height,
            sim.included,
            proposer.public_key_hex(),
            sim.state_root,
        );
        block.sign(proposer);
        block
    }

    #[test]
    fn fresh_db_has_genesis_and_empty_state() {
        let db = LedgerDb::open_temporary().unwrap();
        assert_eq!(db.latest_height().unwrap(), 0);
        assert_eq!(db.latest_block().unwrap(), Block::genesis());
        assert_eq!(db.compute_state_root().unwrap(), ZERO_HASH);
    }

    #[test]
    fn two_block_scenario() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let alice = NodeKeypair::generate();

        let b1 = next_block(&db, &node, vec![set_tx(&alice, 0, "a", json!("1"))]);
        let applied = db.apply_block_atomically(&b1).unwrap();
        assert_eq!(applied.height, 1);
        assert_eq!(applied.confirmed.len(), 1);
        let entry = db.get_state("a").unwrap().unwrap();
        assert_eq!(entry.value, json!("1"));
        assert_eq!(entry.version, 1);

        let b2 = next_block(&db, &node, vec![set_tx(&alice, 1, "a", json!("2"))]);
        db.apply_block_atomically(&b2).unwrap();
        let entry = db.get_state("a").unwrap().unwrap();
        assert_eq!(entry.value, json!("2"));
        assert_eq!(entry.version, 2);
        assert_eq!(db.latest_height().unwrap(), 2);
        assert_ne!(b1.header.state_root, b2.header.state_root);
        assert_eq!(db.compute_state_root().unwrap(), b2.header.state_root);
        assert_eq!(db.get_next_nonce(&alice.public_key_hex()).unwrap(), 2);
    }

    #[test]
    fn identical_blocks_give_identical_roots_on_two_nodes() {
        let a = LedgerDb::open_temporary().unwrap();
        let b = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();

        for i in 0..3 {
            let block = next_block(
                &a,
                &node,
                vec![set_tx(&user, i, &format!("k{}", i), json!({"n": i}))],
            );
            a.apply_block_atomically(&block).unwrap();
            b.apply_block_atomically(&block).unwrap();
        }
        assert_eq!(
            a.compute_state_root().unwrap(),
            b.compute_state_root().unwrap()
        );
    }

    #[test]
    fn reapplying_a_block_is_a_noop() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let block = next_block(&db, &node, vec![set_tx(&user, 0, "x", json!(1))]);
        db.apply_block_atomically(&block).unwrap();
        let again = db.apply_block_atomically(&block).unwrap();
        assert!(again.confirmed.is_empty());
        assert_eq!(db.get_state("x").unwrap().unwrap().version, 1);
    }

    #[test]
    fn bad_state_root_rolls_back_everything() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let tx = set_tx(&user, 0, "x", json!(1));
        db.add_pending(&tx).unwrap();

        let mut block = next_block(&db, &node, vec![tx.clone()]);
        block.header.state_root = [7u8; 32];
        block.header.hash = block.compute_hash();
        block.sign(&node);

        let err = db.apply_block_atomically(&block).unwrap_err();
        assert!(matches!(err, StorageError::StateRootMismatch { .. }));
        assert!(!err.is_fatal());
        assert!(!db.is_halted());
        assert_eq!(db.latest_height().unwrap(), 0);
        assert!(db.get_state("x").unwrap().is_none());
        assert!(db.contains_pending(&tx.hash).unwrap());
        assert_eq!(db.get_next_nonce(&user.public_key_hex()).unwrap(), 0);
    }

    #[test]
    fn block_with_failing_transaction_is_rejected() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let tip = db.latest_block().unwrap();
        let bad = set_tx(&user, 5, "x", json!(1));
        let mut block = Block::new(1, tip.hash(), 1, vec![bad], node.public_key_hex(), ZERO_HASH);
        block.sign(&node);
        assert!(matches!(
            db.apply_block_atomically(&block),
            Err(StorageError::BlockRejected { height: 1, .. })
        ));
    }

    #[test]
    fn height_gap_is_rejected() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let mut block = Block::new(2, [1u8; 32], 1, vec![], node.public_key_hex(), ZERO_HASH);
        block.sign(&node);
        assert!(matches!(
            db.apply_block_atomically(&block),
            Err(StorageError::BlockRejected { height: 2, .. })
        ));
    }

    #[test]
    fn applying_clears_pending_and_confirms() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let tx = set_tx(&user, 0, "x", json!(1));
        assert!(db.add_pending(&tx).unwrap());
        assert!(!db.add_pending(&tx).unwrap());
        assert_eq!(
            db.transaction_status(&tx.hash).unwrap(),
            Some(TransactionStatus::Pending)
        );

        let block = next_block(&db, &node, db.pending_transactions().unwrap());
        db.apply_block_atomically(&block).unwrap();

        assert_eq!(db.pending_count(), 0);
        assert_eq!(
            db.transaction_status(&tx.hash).unwrap(),
            Some(TransactionStatus::Confirmed { block_height: 1 })
        );
        // Confirmed transactions can't re-enter the pool.
        assert!(!db.add_pending(&tx).unwrap());
    }

    #[test]
    fn pending_pool_orders_by_nonce_then_arrival() {
        let db = LedgerDb::open_temporary().unwrap();
        let alice = NodeKeypair::generate();
        let bob = NodeKeypair::generate();
        let a1 = set_tx(&alice, 1, "a", json!(1));
        let b0 = set_tx(&bob, 0, "b", json!(0));
        let a0 = set_tx(&alice, 0, "a", json!(0));
        for tx in [&a1, &b0, &a0] {
            db.add_pending(tx).unwrap();
        }
        let order: Vec<String> = db
            .pending_transactions()
            .unwrap()
            .into_iter()
            .map(|t| t.hash)
            .collect();
        assert_eq!(order, vec![b0.hash.clone(), a0.hash.clone(), a1.hash.clone()]);
        assert!(db.pending_has_nonce(&alice.public_key_hex(), 1).unwrap());
        assert!(!db.pending_has_nonce(&bob.public_key_hex(), 1).unwrap());
    }

    #[test]
    fn simulate_defers_future_nonces_and_rejects_stale_ones() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let block = next_block(&db, &node, vec![set_tx(&user, 0, "x", json!(1))]);
        db.apply_block_atomically(&block).unwrap();

        let stale = set_tx(&user, 0, "x", json!(2));
        let good = set_tx(&user, 1, "x", json!(3));
        let future = set_tx(&user, 5, "x", json!(4));
        let sim = db
            .simulate(&[], &[stale, good.clone(), future], 2, 10, LIMITS)
            .unwrap();
        assert_eq!(sim.included, vec![good]);
        assert_eq!(sim.rejected.len(), 1);
        assert_eq!(sim.deferred, 1);
    }

    #[test]
    fn simulate_builds_on_uncommitted_ancestors() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let ancestor = next_block(&db, &node, vec![set_tx(&user, 0, "x", json!(1))]);

        let follow_up = set_tx(&user, 1, "x", json!(2));
        let sim = db
            .simulate(&[ancestor.clone()], &[follow_up.clone()], 2, 10, LIMITS)
            .unwrap();
        assert_eq!(sim.included, vec![follow_up]);

        db.apply_block_atomically(&ancestor).unwrap();
        let mut second = Block::new(
            2,
            ancestor.hash(),
            10,
            sim.included,
            node.public_key_hex(),
            sim.state_root,
        );
        second.sign(&node);
        db.apply_block_atomically(&second).unwrap();
        assert_eq!(db.get_state("x").unwrap().unwrap().version, 2);
    }

    #[test]
    fn block_limits_defer_overflow() {
        let db = LedgerDb::open_temporary().unwrap();
        let users: Vec<NodeKeypair> = (0..3).map(|_| NodeKeypair::generate()).collect();
        let txs: Vec<Transaction> = users
            .iter()
            .map(|u| set_tx(u, 0, "k", json!(1)))
            .collect();
        let limits = BlockLimits {
            max_transactions: 2,
            max_bytes: 1 << 20,
        };
        let sim = db.simulate(&[], &txs, 1, 1, limits).unwrap();
        assert_eq!(sim.included.len(), 2);
        assert_eq!(sim.deferred, 1);
    }

    #[test]
    fn reject_transaction_records_reason() {
        let db = LedgerDb::open_temporary().unwrap();
        let user = NodeKeypair::generate();
        let tx = set_tx(&user, 0, "x", json!(1));
        db.add_pending(&tx).unwrap();
        db.reject_transaction(&tx.hash, "nope").unwrap();
        assert!(!db.contains_pending(&tx.hash).unwrap());
        assert_eq!(
            db.transaction_status(&tx.hash).unwrap(),
            Some(TransactionStatus::Rejected {
                reason: "nope".into()
            })
        );
    }

    #[test]
    fn halted_store_refuses_writes() {
        let db = LedgerDb::open_temporary().unwrap();
        db.halt("test");
        let user = NodeKeypair::generate();
        let tx = set_tx(&user, 0, "x", json!(1));
        assert!(matches!(db.add_pending(&tx), Err(StorageError::Halted)));
        assert!(matches!(
            db.update_nonce("a", 1),
            Err(StorageError::Halted)
        ));
        // Reads still work.
        assert_eq!(db.latest_height().unwrap(), 0);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let root = {
            let db = LedgerDb::open(dir.path()).unwrap();
            let block = next_block(&db, &node, vec![set_tx(&user, 0, "x", json!(1))]);
            db.apply_block_atomically(&block).unwrap();
            db.flush().unwrap();
            db.compute_state_root().unwrap()
        };
        let db = LedgerDb::open(dir.path()).unwrap();
        assert_eq!(db.latest_height().unwrap(), 1);
        assert_eq!(db.compute_state_root().unwrap(), root);
        assert_eq!(db.get_next_nonce(&user.public_key_hex()).unwrap(), 1);
    }

    #[test]
    fn query_reads_world_state() {
        let db = LedgerDb::open_temporary().unwrap();
        let node = NodeKeypair::generate();
        let user = NodeKeypair::generate();
        let block = next_block(
            &db,
            &node,
            vec![
                set_tx(&user, 0, "app:a", json!(1)),
                set_tx(&user, 1, "app:b", json!(2)),
                set_tx(&user, 2, "other", json!(3)),
            ],
        );
        db.apply_block_atomically(&block).unwrap();

        let rows = db
            .query(
                "SELECT key, value FROM world_state WHERE key LIKE ? ORDER BY key DESC",
                &[json!("app:%")],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["key"], json!("app:b"));

        assert!(matches!(
            db.query("DELETE FROM world_state", &[]),
            Err(QueryError::NotReadOnly(_))
        ));
        assert_eq!(db.get_state("other").unwrap().unwrap().value, json!(3));
    }
}
