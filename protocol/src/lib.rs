// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # RaftChain — Core Library
//!
//! An embeddable private blockchain node for a known set of organizations.
//! Blocks are ordered by a Raft log, executed deterministically against a
//! versioned key-value world state, and spread over a small TCP peer mesh.
//!
//! ## Architecture
//!
//! - **crypto** — Ed25519 identities, SHA-256 hashing, node ids.
//! - **transaction** — Transaction types, construction, signing, validation.
//! - **contract** — The sandboxed script runtime for contract transactions.
//! - **storage** — Blocks, world state, pending pool, read-only queries.
//! - **consensus** — The Raft state machine and its durable log.
//! - **network** — Wire protocol, peer mesh, block sync.
//! - **node** — The orchestrator that ties all of the above together.
//! - **config** — Protocol constants and defaults.
//!
//! ## Quick Start
//!
//! ```no_run
//! use raftchain_protocol::crypto::keys::NodeKeypair;
//! use raftchain_protocol::node::{Node, NodeConfig};
//! use raftchain_protocol::transaction::{TransactionBuilder, TransactionPayload};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::start(NodeConfig::default(), NodeKeypair::generate()).await?;
//! let client = NodeKeypair::generate();
//! let tx = TransactionBuilder::new(TransactionPayload::StateSet {
//!     key: "asset:1".into(),
//!     value: serde_json::json!({"owner": "org1"}),
//! })
//! .nonce(node.next_nonce(&client.public_key_hex())?)
//! .sign(&client);
//! node.submit(tx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Philosophy
//!
//! 1. Every node that applies the same blocks ends with the same state root.
//! 2. A block is applied completely or not at all.
//! 3. Consensus is a pure state machine; I/O lives at the edges.

pub mod config;
pub mod consensus;
pub mod contract;
pub mod crypto;
pub mod network;
pub mod node;
pub mod storage;
pub mod transaction;

pub use node::{Mode, Node, NodeConfig, NodeError, NodeEvent, NodeHandle, NodeResult, NodeStatus};
