//! Transaction signing with Ed25519 keypairs.
//!
//! The signature covers the 32 raw bytes of the content hash. Since the hash
//! already commits to every other field, signing the hash is equivalent to
//! signing the whole transaction, and verifiers don't have to re-serialize
//! anything beyond what hash verification already does.

use super::builder::Transaction;
use crate::crypto::keys::NodeKeypair;

/// Signs a transaction in place.
///
/// The caller is responsible for `tx.sender` matching the keypair. A
/// mismatch produces a signature that [`super::verify_transaction`] rejects.
pub fn sign_transaction<'a>(tx: &'a mut Transaction, keypair: &NodeKeypair) -> &'a Transaction {
    let digest = tx.hash_bytes().unwrap_or_else(|| {
        let recomputed = tx.compute_hash();
        tx.hash = recomputed;
        tx.hash_bytes().unwrap_or_default()
    });
    tx.signature = Some(keypair.sign(&digest).to_hex());
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{verify_transaction, TransactionBuilder, TransactionPayload};

    #[test]
    fn sign_sets_signature_field() {
        let kp = NodeKeypair::generate();
        let mut tx = TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
            .sender(&kp.public_key_hex())
            .build();
        assert!(!tx.is_signed());
        sign_transaction(&mut tx, &kp);
        assert!(tx.is_signed());
        assert!(verify_transaction(&tx).is_ok());
    }

    #[test]
    fn signing_is_deterministic() {
        let kp = NodeKeypair::from_seed(&[5u8; 32]);
        let build = || {
            TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
                .timestamp(10)
                .sign(&kp)
        };
        assert_eq!(build().signature, build().signature);
    }

    #[test]
    fn malformed_hash_is_repaired_before_signing() {
        let kp = NodeKeypair::generate();
        let mut tx = TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
            .sender(&kp.public_key_hex())
            .build();
        tx.hash = "garbage".into();
        sign_transaction(&mut tx, &kp);
        assert_eq!(tx.hash, tx.compute_hash());
        assert!(verify_transaction(&tx).is_ok());
    }
}
