//! # Hashing Utilities
//!
//! Two hash functions, each with exactly one job:
//!
//! - **BLAKE3** — content addressing. Transaction hashes, block hashes,
//!   Merkle roots and the world-state root all go through BLAKE3.
//! - **SHA-256** — node identifiers. A node id is a short prefix of the
//!   SHA-256 digest of the node's public key, so operators can derive it
//!   with any off-the-shelf tool.
//!
//! Everything here is a pure function. If two nodes feed the same bytes in,
//! they get the same bytes out, which is the entire foundation of state-root
//! agreement.

use sha2::{Digest, Sha256};

/// A 32-byte digest. Block hashes, Merkle roots and state roots are all this.
pub type Hash = [u8; 32];

/// The all-zero digest. Used as the genesis previous-hash sentinel, the
/// empty Merkle root, and the state root of an empty world state.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the SHA-256 hash of the input data as a fixed-size array.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// Compute the BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use raftchain_protocol::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"raftchain");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without building a concatenated buffer.
///
/// Feeding parts sequentially gives the same digest as hashing their
/// concatenation, so callers must include their own separators or fixed-width
/// fields when ambiguity matters.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute a binary Merkle root over ordered leaf hashes using BLAKE3.
///
/// When a level has an odd number of nodes the last node is duplicated,
/// which also means a single leaf is paired with itself. An empty leaf set
/// yields [`ZERO_HASH`].
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    loop {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            next.push(blake3_hash_multi(&[left.as_slice(), right.as_slice()]));
        }
        level = next;
        if level.len() == 1 {
            return level[0];
        }
    }
}

/// Decode a 64-character hex string into a [`Hash`].
pub fn hash_from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

/// Serde adapter that writes a [`Hash`] as a hex string instead of a
/// 32-element number array. Use with `#[serde(with = "hex_serde")]`.
pub mod hex_serde {
    use super::{hash_from_hex, Hash};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        hash_from_hex(&s).ok_or_else(|| D::Error::custom("expected 64 hex characters"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let hash = sha256(b"");
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(hash.as_slice(), expected.as_slice());
    }

    #[test]
    fn blake3_is_deterministic_and_case_sensitive() {
        assert_eq!(blake3_hash(b"chain"), blake3_hash(b"chain"));
        assert_ne!(blake3_hash(b"chain"), blake3_hash(b"Chain"));
    }

    #[test]
    fn blake3_multi_matches_concatenation() {
        let multi = blake3_hash_multi(&[b"hello".as_slice(), b" world".as_slice()]);
        assert_eq!(multi, blake3_hash(b"hello world"));
    }

    #[test]
    fn merkle_root_of_nothing_is_zero() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
    }

    #[test]
    fn merkle_single_leaf_pairs_with_itself() {
        let leaf = blake3_hash(b"only child");
        let expected = blake3_hash_multi(&[leaf.as_slice(), leaf.as_slice()]);
        assert_eq!(merkle_root(&[leaf]), expected);
    }

    #[test]
    fn merkle_odd_level_duplicates_last() {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        let c = blake3_hash(b"c");
        let ab = blake3_hash_multi(&[a.as_slice(), b.as_slice()]);
        let cc = blake3_hash_multi(&[c.as_slice(), c.as_slice()]);
        let expected = blake3_hash_multi(&[ab.as_slice(), cc.as_slice()]);
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn merkle_order_matters() {
        let a = blake3_hash(b"first");
        let b = blake3_hash(b"second");
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }

    #[test]
    fn hex_roundtrip_rejects_wrong_length() {
        let h = blake3_hash(b"x");
        assert_eq!(hash_from_hex(&hex::encode(h)), Some(h));
        assert_eq!(hash_from_hex("abcd"), None);
        assert_eq!(hash_from_hex("not hex"), None);
    }
}
