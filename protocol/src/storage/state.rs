//! # World State
//!
//! The world state is a table of versioned key/value rows. Every committed
//! block mutates it, and every block header commits to the full table through
//! its `state_root`.
//!
//! ## State Root
//!
//! ```text
//! rows (ascending key)  ──►  "key:value:version"  ──►  join("|")  ──►  BLAKE3
//! ```
//!
//! `value` is canonical JSON (object keys sorted, no whitespace), so two nodes
//! holding the same rows produce the same bytes no matter how the values were
//! built. An empty table hashes to the all-zero sentinel rather than to
//! `BLAKE3("")`, which makes "nothing here yet" obvious in a block header.
//!
//! ## Overlays
//!
//! Blocks are executed against a [`StateOverlay`]: a copy-on-write layer over
//! committed state. Reads fall through to the base; writes stay in the
//! overlay until the storage engine commits the whole thing in one sled
//! transaction. The overlay also keeps a per-transaction journal so a failing
//! transaction can be undone without disturbing the ones before it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::db::{StorageError, StorageResult};
use crate::crypto::hash::{Hash, ZERO_HASH};

// ---------------------------------------------------------------------------
// WorldStateEntry
// ---------------------------------------------------------------------------

/// One row of world state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldStateEntry {
    pub key: String,
    pub value: Value,
    /// Starts at 1 and increases by one on every write to the key.
    pub version: u64,
    /// Timestamp (ms) of the block that last wrote the row.
    pub updated_at: u64,
    /// Hex public key of the sender whose transaction last wrote the row.
    pub updated_by: String,
    /// Height of the block that last wrote the row.
    pub block_height: u64,
}

/// Attribution for a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub sender: String,
    pub block_height: u64,
    pub timestamp: u64,
}

/// Read access to committed state.
pub trait StateView {
    fn get_entry(&self, key: &str) -> StorageResult<Option<WorldStateEntry>>;

    /// Next expected nonce for `sender` (0 if never seen).
    fn next_nonce(&self, sender: &str) -> StorageResult<u64>;

    /// Every row, in ascending key order.
    fn entries(&self) -> Box<dyn Iterator<Item = StorageResult<WorldStateEntry>> + '_>;
}

// ---------------------------------------------------------------------------
// Canonical encoding & state root
// ---------------------------------------------------------------------------

/// Serialize a JSON value with object keys sorted and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Incremental state-root hasher. Feed rows in ascending key order.
pub struct StateRootBuilder {
    hasher: blake3::Hasher,
    rows: u64,
}

impl StateRootBuilder {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            rows: 0,
        }
    }

    pub fn push(&mut self, entry: &WorldStateEntry) {
        if self.rows > 0 {
            self.hasher.update(b"|");
        }
        let row = format!(
            "{}:{}:{}",
            entry.key,
            canonical_json(&entry.value),
            entry.version
        );
        self.hasher.update(row.as_bytes());
        self.rows += 1;
    }

    pub fn finish(self) -> Hash {
        if self.rows == 0 {
            return ZERO_HASH;
        }
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for StateRootBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State root over an ordered row stream.
pub fn compute_state_root<I>(rows: I) -> StorageResult<Hash>
where
    I: Iterator<Item = StorageResult<WorldStateEntry>>,
{
    let mut builder = StateRootBuilder::new();
    for row in rows {
        builder.push(&row?);
    }
    Ok(builder.finish())
}

// ---------------------------------------------------------------------------
// StateOverlay
// ---------------------------------------------------------------------------

enum JournalRecord {
    /// `previous` is the overlay's own slot before the write: `None` means
    /// the key wasn't in the overlay at all.
    Entry {
        key: String,
        previous: Option<Option<WorldStateEntry>>,
    },
    Nonce {
        sender: String,
        previous: Option<u64>,
    },
}

/// Copy-on-write view over committed state.
pub struct StateOverlay<'a> {
    base: &'a dyn StateView,
    /// `Some(entry)` is a write, `None` a deletion.
    changes: BTreeMap<String, Option<WorldStateEntry>>,
    nonces: BTreeMap<String, u64>,
    journal: Option<Vec<JournalRecord>>,
}

impl<'a> StateOverlay<'a> {
    pub fn new(base: &'a dyn StateView) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
            nonces: BTreeMap::new(),
            journal: None,
        }
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<WorldStateEntry>> {
        match self.changes.get(key) {
            Some(slot) => Ok(slot.clone()),
            None => self.base.get_entry(key),
        }
    }

    /// The value stored at `key`, if any.
    pub fn get_value(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.get(key)?.map(|e| e.value))
    }

    /// Write `value` at `key`, bumping the version.
    pub fn put(
        &mut self,
        key: &str,
        value: Value,
        ctx: &WriteContext,
    ) -> StorageResult<WorldStateEntry> {
        let version = self.get(key)?.map(|e| e.version + 1).unwrap_or(1);
        let entry = WorldStateEntry {
            key: key.to_string(),
            value,
            version,
            updated_at: ctx.timestamp,
            updated_by: ctx.sender.clone(),
            block_height: ctx.block_height,
        };
        self.record_entry(key);
        self.changes.insert(key.to_string(), Some(entry.clone()));
        Ok(entry)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&mut self, key: &str) -> StorageResult<bool> {
        let existed = self.get(key)?.is_some();
        if existed {
            self.record_entry(key);
            self.changes.insert(key.to_string(), None);
        }
        Ok(existed)
    }

    pub fn next_nonce(&self, sender: &str) -> StorageResult<u64> {
        match self.nonces.get(sender) {
            Some(n) => Ok(*n),
            None => self.base.next_nonce(sender),
        }
    }

    pub fn set_next_nonce(&mut self, sender: &str, next: u64) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(JournalRecord::Nonce {
                sender: sender.to_string(),
                previous: self.nonces.get(sender).copied(),
            });
        }
        self.nonces.insert(sender.to_string(), next);
    }

    fn record_entry(&mut self, key: &str) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(JournalRecord::Entry {
                key: key.to_string(),
                previous: self.changes.get(key).cloned(),
            });
        }
    }

    // -- Per-transaction journaling -----------------------------------------

    /// Start recording undo information.
    pub fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    /// Keep everything written since [`begin`](Self::begin).
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undo everything written since [`begin`](Self::begin).
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for record in journal.into_iter().rev() {
            match record {
                JournalRecord::Entry { key, previous } => match previous {
                    Some(slot) => {
                        self.changes.insert(key, slot);
                    }
                    None => {
                        self.changes.remove(&key);
                    }
                },
                JournalRecord::Nonce { sender, previous } => match previous {
                    Some(n) => {
                        self.nonces.insert(sender, n);
                    }
                    None => {
                        self.nonces.remove(&sender);
                    }
                },
            }
        }
    }

    // -- Output --------------------------------------------------------------

    /// Rows written or deleted so far.
    pub fn changes(&self) -> &BTreeMap<String, Option<WorldStateEntry>> {
        &self.changes
    }

    /// Nonce counters advanced so far.
    pub fn nonces(&self) -> &BTreeMap<String, u64> {
        &self.nonces
    }

    /// Root of base state with this overlay's changes merged in.
    pub fn state_root(&self) -> StorageResult<Hash> {
        let mut builder = StateRootBuilder::new();
        let mut base = self.base.entries();
        let mut next_base = || -> StorageResult<Option<WorldStateEntry>> { base.next().transpose() };

        let mut pending = next_base()?;
        for (key, change) in &self.changes {
            while let Some(entry) = pending.take() {
                if entry.key < *key {
                    builder.push(&entry);
                    pending = next_base()?;
                } else {
                    if entry.key != *key {
                        pending = Some(entry);
                    } else {
                        pending = next_base()?;
                    }
                    break;
                }
            }
            if let Some(entry) = change {
                builder.push(entry);
            }
        }
        while let Some(entry) = pending.take() {
            builder.push(&entry);
            pending = next_base()?;
        }
        Ok(builder.finish())
    }
}

/// An empty base, for tests and for genesis.
pub struct EmptyState;

impl StateView for EmptyState {
    fn get_entry(&self, _key: &str) -> StorageResult<Option<WorldStateEntry>> {
        Ok(None)
    }

    fn next_nonce(&self, _sender: &str) -> StorageResult<u64> {
        Ok(0)
    }

    fn entries(&self) -> Box<dyn Iterator<Item = StorageResult<WorldStateEntry>> + '_> {
        Box::new(std::iter::empty())
    }
}

/// In-memory committed state. Used by tests and by overlays stacked on
/// top of uncommitted blocks.
#[derive(Debug, Default, Clone)]
pub struct MemoryState {
    pub rows: BTreeMap<String, WorldStateEntry>,
    pub nonces: BTreeMap<String, u64>,
}

impl MemoryState {
    /// Fold an overlay's changes into this state.
    pub fn absorb(&mut self, overlay: &StateOverlay<'_>) {
        for (key, change) in overlay.changes() {
            match change {
                Some(entry) => {
                    self.rows.insert(key.clone(), entry.clone());
                }
                None => {
                    self.rows.remove(key);
                }
            }
        }
        for (sender, next) in overlay.nonces() {
            self.nonces.insert(sender.clone(), *next);
        }
    }
}

impl StateView for MemoryState {
    fn get_entry(&self, key: &str) -> StorageResult<Option<WorldStateEntry>> {
        Ok(self.rows.get(key).cloned())
    }

    fn next_nonce(&self, sender: &str) -> StorageResult<u64> {
        Ok(self.nonces.get(sender).copied().unwrap_or(0))
    }

    fn entries(&self) -> Box<dyn Iterator<Item = StorageResult<WorldStateEntry>> + '_> {
        Box::new(self.rows.values().cloned().map(Ok))
    }
}

/// Wrap a decode failure from a stored row.
pub(crate) fn corrupt_row(key: &[u8], err: impl std::fmt::Display) -> StorageError {
    StorageError::Corruption(format!(
        "world_state row {:?}: {}",
        String::from_utf8_lossy(key),
        err
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(height: u64) -> WriteContext {
        WriteContext {
            sender: "alice".into(),
            block_height: height,
            timestamp: 1_000 + height,
        }
    }

    #[test]
    fn empty_state_root_is_zero_sentinel() {
        let overlay = StateOverlay::new(&EmptyState);
        assert_eq!(overlay.state_root().unwrap(), ZERO_HASH);
    }

    #[test]
    fn single_write_changes_root_deterministically() {
        let mut overlay = StateOverlay::new(&EmptyState);
        overlay.put("k", json!("v"), &ctx(1)).unwrap();
        let a = overlay.state_root().unwrap();
        let b = overlay.state_root().unwrap();
        assert_ne!(a, ZERO_HASH);
        assert_eq!(a, b);
    }

    #[test]
    fn versions_increment_per_key() {
        let mut overlay = StateOverlay::new(&EmptyState);
        assert_eq!(overlay.put("a", json!(1), &ctx(1)).unwrap().version, 1);
        assert_eq!(overlay.put("a", json!(2), &ctx(2)).unwrap().version, 2);
        assert_eq!(overlay.put("b", json!(1), &ctx(2)).unwrap().version, 1);
    }

    #[test]
    fn overlay_root_matches_materialized_root() {
        let mut committed = MemoryState::default();
        {
            let mut first = StateOverlay::new(&EmptyState);
            first.put("a", json!(1), &ctx(1)).unwrap();
            first.put("c", json!(3), &ctx(1)).unwrap();
            first.put("e", json!(5), &ctx(1)).unwrap();
            committed.absorb(&first);
        }

        let mut overlay = StateOverlay::new(&committed);
        overlay.put("b", json!(2), &ctx(2)).unwrap();
        overlay.delete("c").unwrap();
        overlay.put("e", json!(50), &ctx(2)).unwrap();
        overlay.put("f", json!(6), &ctx(2)).unwrap();
        let merged_root = overlay.state_root().unwrap();

        let mut materialized = committed.clone();
        materialized.absorb(&overlay);
        let direct = compute_state_root(materialized.entries()).unwrap();
        assert_eq!(merged_root, direct);
        assert_eq!(materialized.rows.len(), 4);
        assert_eq!(materialized.rows["e"].version, 2);
    }

    #[test]
    fn rollback_restores_previous_overlay_contents() {
        let mut overlay = StateOverlay::new(&EmptyState);
        overlay.put("keep", json!(1), &ctx(1)).unwrap();
        overlay.set_next_nonce("alice", 1);
        let before = overlay.state_root().unwrap();

        overlay.begin();
        overlay.put("keep", json!(2), &ctx(1)).unwrap();
        overlay.put("temp", json!(3), &ctx(1)).unwrap();
        overlay.set_next_nonce("alice", 2);
        overlay.rollback();

        assert_eq!(overlay.state_root().unwrap(), before);
        assert!(overlay.get("temp").unwrap().is_none());
        assert_eq!(overlay.get("keep").unwrap().unwrap().value, json!(1));
        assert_eq!(overlay.next_nonce("alice").unwrap(), 1);
    }

    #[test]
    fn delete_of_missing_key_is_reported() {
        let mut overlay = StateOverlay::new(&EmptyState);
        assert!(!overlay.delete("ghost").unwrap());
        assert!(overlay.changes().is_empty());
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#
        );
        assert_eq!(canonical_json(&json!("x\"y")), r#""x\"y""#);
    }

    #[test]
    fn row_format_is_key_value_version() {
        let entry = WorldStateEntry {
            key: "k".into(),
            value: json!("v"),
            version: 1,
            updated_at: 0,
            updated_by: String::new(),
            block_height: 1,
        };
        let mut builder = StateRootBuilder::new();
        builder.push(&entry);
        assert_eq!(builder.finish(), crate::crypto::blake3_hash(br#"k:"v":1"#));
    }
}
