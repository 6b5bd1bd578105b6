//! # Key Management
//!
//! Ed25519 keypairs for node and client identities.
//!
//! Every node signs the blocks it proposes and every client signs the
//! transactions it submits. Both use the same [`NodeKeypair`] type; the
//! difference is only in who holds it.
//!
//! ## Node identifiers
//!
//! Peers address each other by a short node id: the first 16 hex characters
//! of `SHA-256(public_key)`. Short enough to read in a log line, long enough
//! that a private cluster won't collide by accident. The full public key is
//! still exchanged during the handshake so the id can be re-derived and
//! checked.
//!
//! ## Security considerations
//!
//! - Key generation uses `OsRng`.
//! - `Debug` never prints secret material.
//! - Key files hold the hex secret and nothing else. Protect them with file
//!   permissions; this module doesn't pretend to be a vault.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use super::hash::sha256;

/// Number of hex characters in a node id.
pub const NODE_ID_HEX_LEN: usize = 16;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: expected 32 bytes of hex")]
    InvalidSecretKey,

    #[error("invalid public key: expected a 32-byte Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// An Ed25519 keypair.
///
/// Intentionally not `Serialize`. Writing a secret key somewhere should be
/// a deliberate call to [`secret_hex`](Self::secret_hex), not a side effect
/// of shoving a struct into JSON.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

/// The public half of a keypair. Serialized as a hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    bytes: [u8; 32],
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 64],
}

impl NodeKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// Tests lean on this heavily: fixed seeds give fixed node ids, which
    /// makes multi-node fixtures readable.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Load a keypair from `path`, or generate one and write it there.
    ///
    /// The file holds the hex-encoded secret key on a single line.
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            return Self::from_hex(&contents);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let keypair = Self::generate();
        std::fs::write(path, format!("{}\n", keypair.secret_hex()))?;
        Ok(keypair)
    }

    /// Hex-encoded secret key. Handle with care.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Returns the public key associated with this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Hex-encoded public key.
    pub fn public_key_hex(&self) -> String {
        self.public_key().to_hex()
    }

    /// The short node id derived from this keypair's public key.
    pub fn node_id(&self) -> String {
        self.public_key().node_id()
    }

    /// Sign a message. Ed25519 signatures are deterministic.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair(pub={})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// PublicKey
// ---------------------------------------------------------------------------

impl PublicKey {
    /// Validate and wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_bytes(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Derive the short node id: the first 16 hex chars of SHA-256(pubkey).
    pub fn node_id(&self) -> String {
        let mut id = hex::encode(sha256(&self.bytes));
        id.truncate(NODE_ID_HEX_LEN);
        id
    }

    /// Verify a signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&signature.bytes);
        verifying_key.verify(message, &sig).is_ok()
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// Derive a node id from a hex-encoded public key, if it parses.
pub fn node_id_from_hex(public_key_hex: &str) -> Option<String> {
    PublicKey::from_hex(public_key_hex).ok().map(|pk| pk.node_id())
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// 128 hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        let arr: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes: arr })
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"block 42");
        assert!(kp.public_key().verify(b"block 42", &sig));
        assert!(!kp.public_key().verify(b"block 43", &sig));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let a = NodeKeypair::generate();
        let b = NodeKeypair::generate();
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = NodeKeypair::from_seed(&[7u8; 32]);
        let b = NodeKeypair::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn node_id_is_short_sha256_prefix() {
        let kp = NodeKeypair::from_seed(&[1u8; 32]);
        let id = kp.node_id();
        assert_eq!(id.len(), NODE_ID_HEX_LEN);
        let full = hex::encode(sha256(kp.public_key().as_bytes()));
        assert!(full.starts_with(&id));
        assert_eq!(node_id_from_hex(&kp.public_key_hex()), Some(id));
    }

    #[test]
    fn secret_hex_roundtrip() {
        let kp = NodeKeypair::generate();
        let restored = NodeKeypair::from_hex(&kp.secret_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
        assert!(NodeKeypair::from_hex("zz").is_err());
    }

    #[test]
    fn signature_hex_roundtrip() {
        let kp = NodeKeypair::generate();
        let sig = kp.sign(b"data");
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(sig, parsed);
        assert!(Signature::from_hex("abcd").is_err());
    }

    #[test]
    fn public_key_serializes_as_hex_string() {
        let kp = NodeKeypair::from_seed(&[3u8; 32]);
        let json = serde_json::to_string(&kp.public_key()).unwrap();
        assert_eq!(json, format!("\"{}\"", kp.public_key_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kp.public_key());
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let kp = NodeKeypair::from_seed(&[9u8; 32]);
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(&kp.secret_hex()));
    }

    #[test]
    fn load_or_generate_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");
        let first = NodeKeypair::load_or_generate(&path).unwrap();
        let second = NodeKeypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }
}
