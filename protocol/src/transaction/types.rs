//! Core type definitions for transactions.
//!
//! The set of transaction kinds is closed. Each kind carries a fixed payload
//! shape, and the pair is serialized adjacently as `{"type": .., "payload": ..}`
//! so the type tag can never disagree with the payload it describes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// TransactionType
// ---------------------------------------------------------------------------

/// Discriminant for the operation a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    StateSet,
    StateDelete,
    ContractDeploy,
    ContractInvoke,
    GovernancePropose,
    GovernanceVote,
    AclSet,
}

impl TransactionType {
    /// Stable tag used in hashing and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateSet => "StateSet",
            Self::StateDelete => "StateDelete",
            Self::ContractDeploy => "ContractDeploy",
            Self::ContractInvoke => "ContractInvoke",
            Self::GovernancePropose => "GovernancePropose",
            Self::GovernanceVote => "GovernanceVote",
            Self::AclSet => "AclSet",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Type-specific transaction body.
///
/// Values are free-form JSON. `serde_json::Map` is ordered by key, so the
/// serialized form of a payload is canonical and safe to hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransactionPayload {
    /// Create or overwrite a world-state key.
    StateSet { key: String, value: Value },
    /// Remove a world-state key.
    StateDelete { key: String },
    /// Register a contract under `contract_id`.
    ContractDeploy { contract_id: String, code: Value },
    /// Call `method` on a deployed contract.
    ContractInvoke {
        contract_id: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    /// Open a governance proposal. The proposer's vote counts as approval.
    GovernancePropose {
        proposal_id: String,
        action: GovernanceAction,
    },
    /// Vote on an open proposal.
    GovernanceVote { proposal_id: String, approve: bool },
    /// Restrict writes to `key` to the listed public keys (plus the owner).
    AclSet { key: String, writers: Vec<String> },
}

impl TransactionPayload {
    pub fn tx_type(&self) -> TransactionType {
        match self {
            Self::StateSet { .. } => TransactionType::StateSet,
            Self::StateDelete { .. } => TransactionType::StateDelete,
            Self::ContractDeploy { .. } => TransactionType::ContractDeploy,
            Self::ContractInvoke { .. } => TransactionType::ContractInvoke,
            Self::GovernancePropose { .. } => TransactionType::GovernancePropose,
            Self::GovernanceVote { .. } => TransactionType::GovernanceVote,
            Self::AclSet { .. } => TransactionType::AclSet,
        }
    }

    /// Whether applying this payload can change the governance member list.
    pub fn touches_membership(&self) -> bool {
        matches!(
            self,
            Self::GovernancePropose { .. } | Self::GovernanceVote { .. }
        )
    }
}

/// What an approved governance proposal does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GovernanceAction {
    /// Add a hex public key to the member (and voter) set.
    AddMember { public_key: String },
    /// Remove a hex public key from the member set.
    RemoveMember { public_key: String },
    /// Write `governance:param:<name>`.
    SetParameter { name: String, value: Value },
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction.
///
/// `Pending` on acceptance into the pool, then exactly one of `Confirmed`
/// (with the including block's height) or `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed { block_height: u64 },
    Rejected { reason: String },
}

impl TransactionStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed { block_height } => write!(f, "confirmed@{}", block_height),
            Self::Rejected { reason } => write!(f, "rejected: {}", reason),
        }
    }
}

/// Returned by submission and status lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub hash: String,
    #[serde(flatten)]
    pub status: TransactionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_serializes_adjacently_tagged() {
        let payload = TransactionPayload::StateSet {
            key: "a".into(),
            value: json!("1"),
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "StateSet");
        assert_eq!(v["payload"]["key"], "a");
        assert_eq!(payload.tx_type(), TransactionType::StateSet);
    }

    #[test]
    fn governance_action_is_tagged_by_kind() {
        let action = GovernanceAction::AddMember {
            public_key: "ab".into(),
        };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["kind"], "add_member");
    }

    #[test]
    fn receipt_flattens_status() {
        let receipt = Receipt {
            hash: "h".into(),
            status: TransactionStatus::Confirmed { block_height: 3 },
        };
        let v = serde_json::to_value(&receipt).unwrap();
        assert_eq!(v["status"], "confirmed");
        assert_eq!(v["block_height"], 3);
        assert!(receipt.status.is_final());
        assert!(!TransactionStatus::Pending.is_final());
    }

    #[test]
    fn type_tags_are_stable() {
        assert_eq!(TransactionType::AclSet.to_string(), "AclSet");
        assert_eq!(TransactionType::GovernanceVote.as_str(), "GovernanceVote");
    }
}
