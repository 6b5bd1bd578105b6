//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers around audited implementations:
//!
//! - **Ed25519** for block and transaction signatures.
//! - **BLAKE3** for content hashes and state roots.
//! - **SHA-256** for node id derivation.
//!
//! Nothing in here is clever, and it should stay that way.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hash_multi, merkle_root, sha256, Hash, ZERO_HASH};
pub use keys::{KeyError, NodeKeypair, PublicKey, Signature};
