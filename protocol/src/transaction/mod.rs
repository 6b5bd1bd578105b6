//! # Transaction Module
//!
//! Construction, signing and stateless verification of transactions.
//!
//! ## Architecture
//!
//! ```text
//! types.rs        — TransactionType, payload shapes, status and receipts
//! builder.rs      — Transaction + fluent TransactionBuilder, canonical hashing
//! signing.rs      — Ed25519 signing over the content hash
//! verification.rs — hash / signature / shape checks
//! ```
//!
//! ## Transaction Lifecycle
//!
//! 1. **Build** with [`TransactionBuilder`].
//! 2. **Sign** with [`sign_transaction`] (or [`TransactionBuilder::sign`]).
//! 3. **Submit** to a node. The node runs [`verify_transaction`] plus the
//!    stateful nonce check, then pools it as `Pending`.
//! 4. **Confirm** when a committed block includes it, or **Reject** if the
//!    leader can't execute it.
//!
//! ## Design Decisions
//!
//! - Hashes are BLAKE3 over a hand-rolled canonical byte layout. The
//!   payload portion is JSON, which is canonical because object keys are
//!   sorted.
//! - Nonces start at 0 and must equal the sender's next nonce exactly. No
//!   gaps, no reuse.

pub mod builder;
pub mod signing;
pub mod types;
pub mod verification;

pub use builder::{Transaction, TransactionBuilder};
pub use signing::sign_transaction;
pub use types::{GovernanceAction, Receipt, TransactionPayload, TransactionStatus, TransactionType};
pub use verification::{is_reserved_key, verify_transaction, TxValidationError};
