//! Raft log storage backends.
//!
//! [`SledRaftLog`] keeps the log next to the ledger in the same sled
//! database, in two trees of its own:
//!
//! ```text
//! raft_log   index (u64 BE)  → LogEntry (JSON)
//! raft_meta  "hard_state"    → HardState (bincode)
//!            "voters"        → Vec<NodeId> (bincode)
//! ```
//!
//! Log entries are JSON like every other record holding a block. The two
//! small metadata records are bincode; nothing outside this file reads
//! them.
//!
//! [`MemoryRaftLog`] is the same thing without the disk, for tests and
//! ephemeral nodes.

use serde::{de::DeserializeOwned, Serialize};
use sled::Tree;

use super::raft::{HardState, LogEntry, NodeId, RaftError, RaftResult, RaftStorage};
use crate::storage::LedgerDb;

const HARD_STATE_KEY: &[u8] = b"hard_state";
const VOTERS_KEY: &[u8] = b"voters";

fn storage_err(e: impl std::fmt::Display) -> RaftError {
    RaftError::Storage(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> RaftError {
    RaftError::Corrupt(e.to_string())
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryRaftLog {
    hard_state: HardState,
    entries: Vec<LogEntry>,
    voters: Option<Vec<NodeId>>,
}

impl RaftStorage for MemoryRaftLog {
    fn hard_state(&self) -> RaftResult<HardState> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.entries.get(index as usize - 1).map(|e| e.term))
    }

    fn entry(&self, index: u64) -> RaftResult<Option<LogEntry>> {
        if index == 0 {
            return Ok(None);
        }
        Ok(self.entries.get(index as usize - 1).cloned())
    }

    fn entries(&self, start: u64, max: usize) -> RaftResult<Vec<LogEntry>> {
        let from = start.max(1) as usize - 1;
        Ok(self.entries.iter().skip(from).take(max).cloned().collect())
    }

    fn append(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        for entry in entries {
            if entry.index != self.last_index() + 1 {
                return Err(corrupt(format!(
                    "append at {} with last index {}",
                    entry.index,
                    self.last_index()
                )));
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> RaftResult<()> {
        self.entries.truncate(index.saturating_sub(1) as usize);
        Ok(())
    }

    fn voters(&self) -> RaftResult<Option<Vec<NodeId>>> {
        Ok(self.voters.clone())
    }

    fn save_voters(&mut self, voters: &[NodeId]) -> RaftResult<()> {
        self.voters = Some(voters.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sled
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SledRaftLog {
    log: Tree,
    meta: Tree,
    last_index: u64,
    last_term: u64,
}

impl SledRaftLog {
    /// Open the raft trees inside the ledger's database.
    pub fn open(db: &LedgerDb) -> RaftResult<Self> {
        let log = db.open_tree("raft_log").map_err(storage_err)?;
        let meta = db.open_tree("raft_meta").map_err(storage_err)?;
        let mut store = Self {
            log,
            meta,
            last_index: 0,
            last_term: 0,
        };
        store.refresh_last()?;
        Ok(store)
    }

    fn refresh_last(&mut self) -> RaftResult<()> {
        match self.log.last().map_err(storage_err)? {
            Some((_, bytes)) => {
                let entry: LogEntry = serde_json::from_slice(&bytes).map_err(corrupt)?;
                self.last_index = entry.index;
                self.last_term = entry.term;
            }
            None => {
                self.last_index = 0;
                self.last_term = 0;
            }
        }
        Ok(())
    }

    fn read_meta<T: DeserializeOwned>(&self, key: &[u8]) -> RaftResult<Option<T>> {
        match self.meta.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(corrupt)?)),
            None => Ok(None),
        }
    }

    fn write_meta<T: Serialize>(&self, key: &[u8], value: &T) -> RaftResult<()> {
        let bytes = bincode::serialize(value).map_err(storage_err)?;
        self.meta.insert(key, bytes).map_err(storage_err)?;
        // Votes and terms must hit disk before any reply goes out.
        self.meta.flush().map_err(storage_err)?;
        Ok(())
    }
}

impl RaftStorage for SledRaftLog {
    fn hard_state(&self) -> RaftResult<HardState> {
        Ok(self.read_meta(HARD_STATE_KEY)?.unwrap_or_default())
    }

    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()> {
        self.write_meta(HARD_STATE_KEY, state)
    }

    fn last_index(&self) -> u64 {
        self.last_index
    }

    fn last_term(&self) -> u64 {
        self.last_term
    }

    fn term_at(&self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.entry(index)?.map(|e| e.term))
    }

    fn entry(&self, index: u64) -> RaftResult<Option<LogEntry>> {
        if index == 0 || index > self.last_index {
            return Ok(None);
        }
        match self.log.get(index.to_be_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(corrupt)?)),
            None => Ok(None),
        }
    }

    fn entries(&self, start: u64, max: usize) -> RaftResult<Vec<LogEntry>> {
        let start = start.max(1);
        self.log
            .range(start.to_be_bytes()..)
            .take(max)
            .map(|item| {
                let (_, bytes) = item.map_err(storage_err)?;
                serde_json::from_slice(&bytes).map_err(corrupt)
            })
            .collect()
    }

    fn append(&mut self, entries: &[LogEntry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        let mut expected = self.last_index + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(corrupt(format!(
                    "append at {} with last index {}",
                    entry.index,
                    expected - 1
                )));
            }
            let bytes = serde_json::to_vec(entry).map_err(storage_err)?;
            batch.insert(&entry.index.to_be_bytes()[..], bytes);
            expected += 1;
        }
        self.log.apply_batch(batch).map_err(storage_err)?;
        self.log.flush().map_err(storage_err)?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
            self.last_term = last.term;
        }
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> RaftResult<()> {
        let mut batch = sled::Batch::default();
        for item in self.log.range(index.max(1).to_be_bytes()..) {
            let (key, _) = item.map_err(storage_err)?;
            batch.remove(key);
        }
        self.log.apply_batch(batch).map_err(storage_err)?;
        self.log.flush().map_err(storage_err)?;
        self.refresh_last()
    }

    fn voters(&self) -> RaftResult<Option<Vec<NodeId>>> {
        self.read_meta(VOTERS_KEY)
    }

    fn save_voters(&mut self, voters: &[NodeId]) -> RaftResult<()> {
        self.write_meta(VOTERS_KEY, &voters.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::ZERO_HASH;
    use crate::storage::Block;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            block: Block::new(index, ZERO_HASH, index, vec![], "p".into(), ZERO_HASH),
        }
    }

    fn exercise(store: &mut impl RaftStorage) {
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.term_at(0).unwrap(), Some(0));
        assert_eq!(store.term_at(1).unwrap(), None);

        store
            .append(&[entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.term_at(2).unwrap(), Some(1));
        assert_eq!(store.entries(2, 10).unwrap().len(), 2);
        assert_eq!(store.entries(1, 2).unwrap().len(), 2);

        // Gaps are refused.
        assert!(store.append(&[entry(2, 9)]).is_err());

        store.truncate_from(2).unwrap();
        assert_eq!(store.last_index(), 1);
        assert_eq!(store.last_term(), 1);
        assert!(store.entry(2).unwrap().is_none());

        store.append(&[entry(3, 2)]).unwrap();
        assert_eq!(store.term_at(2).unwrap(), Some(3));
    }

    #[test]
    fn memory_log_semantics() {
        exercise(&mut MemoryRaftLog::default());
    }

    #[test]
    fn sled_log_semantics() {
        let db = LedgerDb::open_temporary().unwrap();
        exercise(&mut SledRaftLog::open(&db).unwrap());
    }

    #[test]
    fn sled_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = LedgerDb::open(dir.path()).unwrap();
            let mut log = SledRaftLog::open(&db).unwrap();
            log.append(&[entry(4, 1), entry(5, 2)]).unwrap();
            log.save_hard_state(&HardState {
                current_term: 5,
                voted_for: Some("abc".into()),
            })
            .unwrap();
            log.save_voters(&["abc".to_string(), "def".to_string()])
                .unwrap();
        }
        let db = LedgerDb::open(dir.path()).unwrap();
        let log = SledRaftLog::open(&db).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 5);
        assert_eq!(log.hard_state().unwrap().voted_for.as_deref(), Some("abc"));
        assert_eq!(log.voters().unwrap().unwrap().len(), 2);
    }
}
