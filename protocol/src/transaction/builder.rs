//! Transaction construction via the builder pattern.
//!
//! The [`TransactionBuilder`] sets the fields, computes the content hash and
//! hands back an unsigned [`Transaction`]. Signing is a separate step in
//! [`super::signing`], with [`TransactionBuilder::sign`] as a shortcut for
//! callers that already hold the sender's keypair.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{TransactionPayload, TransactionType};
use crate::crypto::hash::{blake3_hash, hash_from_hex, Hash};
use crate::crypto::keys::NodeKeypair;

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A signed request to change world state.
///
/// # Canonical Byte Format
///
/// [`Transaction::signable_bytes`] covers the type tag, sender, nonce,
/// timestamp and payload. `hash` is `hex(blake3(signable_bytes))` and the
/// signature is Ed25519 over the 32 raw hash bytes. Neither `hash` nor
/// `signature` feed back into the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash, hex encoded.
    pub hash: String,

    /// Type tag and body, serialized as `"type"` / `"payload"`.
    #[serde(flatten)]
    pub payload: TransactionPayload,

    /// Hex-encoded Ed25519 public key of the sender.
    pub sender: String,

    /// Per-sender sequence number, starting at 0.
    pub nonce: u64,

    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,

    /// Hex-encoded signature over the hash. `None` until signed.
    pub signature: Option<String>,
}

impl Transaction {
    pub fn tx_type(&self) -> TransactionType {
        self.payload.tx_type()
    }

    /// Canonical bytes for hashing.
    ///
    /// Null-separated strings and fixed-width little-endian integers, then the
    /// payload's JSON. Payload JSON is canonical because object keys are
    /// kept sorted by `serde_json::Map`.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(self.tx_type().as_str().as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        // Serializing plain JSON values into a Vec cannot fail.
        buf.extend_from_slice(&serde_json::to_vec(&self.payload).unwrap_or_default());
        buf
    }

    /// Recompute the content hash from the current field values.
    pub fn compute_hash(&self) -> String {
        hex::encode(blake3_hash(&self.signable_bytes()))
    }

    /// The stored hash as raw bytes, if it is well-formed hex.
    pub fn hash_bytes(&self) -> Option<Hash> {
        hash_from_hex(&self.hash)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Size of the JSON encoding, used for payload limits.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// TransactionBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Transaction`].
///
/// ```rust
/// use raftchain_protocol::crypto::NodeKeypair;
/// use raftchain_protocol::transaction::{TransactionBuilder, TransactionPayload};
/// use serde_json::json;
///
/// let kp = NodeKeypair::generate();
/// let tx = TransactionBuilder::new(TransactionPayload::StateSet {
///     key: "a".into(),
///     value: json!("1"),
/// })
/// .nonce(0)
/// .sign(&kp);
/// assert!(tx.is_signed());
/// ```
///
/// `timestamp` defaults to the current UTC time at build.
pub struct TransactionBuilder {
    payload: TransactionPayload,
    sender: String,
    nonce: u64,
    timestamp: Option<u64>,
}

impl TransactionBuilder {
    pub fn new(payload: TransactionPayload) -> Self {
        Self {
            payload,
            sender: String::new(),
            nonce: 0,
            timestamp: None,
        }
    }

    /// Sets the sender's hex public key. [`sign`](Self::sign) overrides it.
    pub fn sender(mut self, public_key_hex: &str) -> Self {
        self.sender = public_key_hex.to_string();
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Sets the timestamp explicitly (Unix milliseconds).
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Produce an unsigned transaction with its hash computed.
    pub fn build(self) -> Transaction {
        let timestamp = self
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis() as u64);

        let mut tx = Transaction {
            hash: String::new(),
            payload: self.payload,
            sender: self.sender,
            nonce: self.nonce,
            timestamp,
            signature: None,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    /// Set the sender from `keypair`, build, and sign.
    pub fn sign(mut self, keypair: &NodeKeypair) -> Transaction {
        self.sender = keypair.public_key_hex();
        let mut tx = self.build();
        super::signing::sign_transaction(&mut tx, keypair);
        tx
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tx() -> Transaction {
        TransactionBuilder::new(TransactionPayload::StateSet {
            key: "inventory:widget".into(),
            value: json!({"count": 3}),
        })
        .sender("aa")
        .nonce(4)
        .timestamp(1_700_000_000_000)
        .build()
    }

    #[test]
    fn build_computes_hash() {
        let tx = sample_tx();
        assert_eq!(tx.hash, tx.compute_hash());
        assert_eq!(tx.hash.len(), 64);
        assert!(tx.hash_bytes().is_some());
        assert!(!tx.is_signed());
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(sample_tx().hash, sample_tx().hash);
    }

    #[test]
    fn every_field_mutation_changes_hash() {
        let base = sample_tx();

        let mut t = base.clone();
        t.sender = "bb".into();
        assert_ne!(t.compute_hash(), base.hash);

        let mut t = base.clone();
        t.nonce += 1;
        assert_ne!(t.compute_hash(), base.hash);

        let mut t = base.clone();
        t.timestamp += 1;
        assert_ne!(t.compute_hash(), base.hash);

        let mut t = base.clone();
        t.payload = TransactionPayload::StateSet {
            key: "inventory:widget".into(),
            value: json!({"count": 4}),
        };
        assert_ne!(t.compute_hash(), base.hash);

        let mut t = base.clone();
        t.payload = TransactionPayload::StateDelete {
            key: "inventory:widget".into(),
        };
        assert_ne!(t.compute_hash(), base.hash);
    }

    #[test]
    fn signature_does_not_affect_hash() {
        let kp = NodeKeypair::generate();
        let unsigned = TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
            .sender(&kp.public_key_hex())
            .timestamp(1)
            .build();
        let signed = TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
            .timestamp(1)
            .sign(&kp);
        assert_eq!(unsigned.hash, signed.hash);
        assert!(signed.is_signed());
    }

    #[test]
    fn json_shape_has_type_and_payload() {
        let v = serde_json::to_value(sample_tx()).unwrap();
        assert_eq!(v["type"], "StateSet");
        assert_eq!(v["payload"]["value"]["count"], 3);
        let back: Transaction = serde_json::from_value(v).unwrap();
        assert_eq!(back, sample_tx());
    }
}
