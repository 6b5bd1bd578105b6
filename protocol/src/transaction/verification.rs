//! Structural and cryptographic verification of signed transactions.
//!
//! Verification here is stateless: it answers "is this a well-formed,
//! authentic transaction?" and nothing else. Whether the nonce is the next
//! one for the sender, or whether the sender may write a key, depends on
//! world state and is decided by the storage executor.

use chrono::Utc;
use thiserror::Error;

use super::builder::Transaction;
use super::types::TransactionPayload;
use crate::config::{MAX_KEY_BYTES, MAX_TX_BYTES, RESERVED_KEY_PREFIXES};
use crate::crypto::keys::{PublicKey, Signature};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Why a transaction failed stateless validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxValidationError {
    #[error("transaction hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("transaction is unsigned")]
    MissingSignature,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("invalid signature: does not verify against sender {sender}")]
    InvalidSignature { sender: String },

    #[error("invalid sender public key: {sender}")]
    InvalidSender { sender: String },

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("key {key:?} is in a reserved namespace")]
    ReservedKey { key: String },

    #[error("transaction is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("timestamp {timestamp_ms} is more than {max_secs}s in the future")]
    TimestampInFuture { timestamp_ms: u64, max_secs: u64 },

    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: u64, actual: u64 },

    #[error("duplicate transaction {hash}")]
    Duplicate { hash: String },
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// How far in the future a timestamp may be before it's rejected.
const MAX_FUTURE_SECONDS: u64 = 300;

/// Verifies a signed transaction.
///
/// Checks, cheapest first: size, timestamp window, key shape, hash
/// integrity, sender key, then the signature itself. Returns the first
/// failure.
pub fn verify_transaction(tx: &Transaction) -> Result<(), TxValidationError> {
    let size = tx.size_bytes();
    if size > MAX_TX_BYTES {
        return Err(TxValidationError::TooLarge {
            size,
            limit: MAX_TX_BYTES,
        });
    }

    let now_ms = Utc::now().timestamp_millis() as u64;
    if tx.timestamp > now_ms + MAX_FUTURE_SECONDS * 1_000 {
        return Err(TxValidationError::TimestampInFuture {
            timestamp_ms: tx.timestamp,
            max_secs: MAX_FUTURE_SECONDS,
        });
    }

    check_payload_shape(&tx.payload)?;

    let expected = tx.compute_hash();
    if tx.hash != expected {
        return Err(TxValidationError::HashMismatch {
            expected,
            actual: tx.hash.clone(),
        });
    }

    let sig_hex = tx
        .signature
        .as_ref()
        .ok_or(TxValidationError::MissingSignature)?;
    let signature =
        Signature::from_hex(sig_hex).map_err(|_| TxValidationError::MalformedSignature)?;

    let sender = PublicKey::from_hex(&tx.sender).map_err(|_| TxValidationError::InvalidSender {
        sender: tx.sender.clone(),
    })?;

    // The hash was just recomputed, so it decodes.
    let digest = tx.hash_bytes().ok_or(TxValidationError::MalformedSignature)?;
    if !sender.verify(&digest, &signature) {
        return Err(TxValidationError::InvalidSignature {
            sender: tx.sender.clone(),
        });
    }

    Ok(())
}

fn check_key(key: &str) -> Result<(), TxValidationError> {
    if key.is_empty() {
        return Err(TxValidationError::InvalidKey {
            key: key.to_string(),
            reason: "empty".into(),
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(TxValidationError::InvalidKey {
            key: key.chars().take(32).collect(),
            reason: format!("longer than {} bytes", MAX_KEY_BYTES),
        });
    }
    Ok(())
}

/// Whether `key` lives in a namespace only the executor may write.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
}

fn check_payload_shape(payload: &TransactionPayload) -> Result<(), TxValidationError> {
    match payload {
        TransactionPayload::StateSet { key, .. } | TransactionPayload::StateDelete { key } => {
            check_key(key)?;
            if is_reserved_key(key) {
                return Err(TxValidationError::ReservedKey { key: key.clone() });
            }
        }
        TransactionPayload::ContractDeploy { contract_id, .. }
        | TransactionPayload::ContractInvoke { contract_id, .. } => check_key(contract_id)?,
        TransactionPayload::GovernancePropose { proposal_id, .. }
        | TransactionPayload::GovernanceVote { proposal_id, .. } => check_key(proposal_id)?,
        TransactionPayload::AclSet { key, writers } => {
            check_key(key)?;
            for writer in writers {
                if PublicKey::from_hex(writer).is_err() {
                    return Err(TxValidationError::InvalidSender {
                        sender: writer.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::transaction::TransactionBuilder;
    use serde_json::json;

    fn signed(payload: TransactionPayload) -> (NodeKeypair, Transaction) {
        let kp = NodeKeypair::generate();
        let tx = TransactionBuilder::new(payload).nonce(0).sign(&kp);
        (kp, tx)
    }

    fn set(key: &str) -> TransactionPayload {
        TransactionPayload::StateSet {
            key: key.into(),
            value: json!("v"),
        }
    }

    #[test]
    fn valid_transaction_passes() {
        let (_, tx) = signed(set("app:a"));
        assert_eq!(verify_transaction(&tx), Ok(()));
    }

    #[test]
    fn tampered_payload_fails_hash_check() {
        let (_, mut tx) = signed(set("app:a"));
        tx.payload = set("app:b");
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::HashMismatch { .. })
        ));
    }

    #[test]
    fn unsigned_transaction_rejected() {
        let (_, mut tx) = signed(set("app:a"));
        tx.signature = None;
        assert_eq!(
            verify_transaction(&tx),
            Err(TxValidationError::MissingSignature)
        );
    }

    #[test]
    fn signature_from_other_key_rejected() {
        let (_, mut tx) = signed(set("app:a"));
        let other = NodeKeypair::generate();
        let digest = tx.hash_bytes().unwrap();
        tx.signature = Some(other.sign(&digest).to_hex());
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn empty_and_reserved_keys_rejected() {
        let (_, tx) = signed(set(""));
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::InvalidKey { .. })
        ));
        let (_, tx) = signed(set("governance:members"));
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::ReservedKey { .. })
        ));
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let kp = NodeKeypair::generate();
        let future = Utc::now().timestamp_millis() as u64 + 3_600_000;
        let tx = TransactionBuilder::new(set("k")).timestamp(future).sign(&kp);
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::TimestampInFuture { .. })
        ));
    }

    #[test]
    fn acl_writers_must_be_public_keys() {
        let (_, tx) = signed(TransactionPayload::AclSet {
            key: "doc:1".into(),
            writers: vec!["not-a-key".into()],
        });
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::InvalidSender { .. })
        ));
    }

    #[test]
    fn oversized_transaction_rejected() {
        let big = "x".repeat(MAX_TX_BYTES + 1);
        let (_, tx) = signed(TransactionPayload::StateSet {
            key: "k".into(),
            value: json!(big),
        });
        assert!(matches!(
            verify_transaction(&tx),
            Err(TxValidationError::TooLarge { .. })
        ));
    }
}
