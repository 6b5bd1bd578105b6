//! # Network Module
//!
//! The peer mesh that consensus rides on: typed messages over TCP,
//! handshake and discovery, health checks, and block catch-up.
//!
//! ## Architecture
//!
//! ```text
//! message.rs  — Envelope, message kinds, length-prefixed JSON framing
//! peer.rs     — Peer table and the duplicate-connection rule
//! mesh.rs     — Listener, dialer, handshake, discovery, ping/pong
//! sync.rs     — Block-range synchronization between nodes
//! ```
//!
//! ## Design Decisions
//!
//! - Ordering is per connection only. Each peer has exactly one live
//!   connection and one writer task, so frames to a peer leave in the order
//!   they were queued. Nothing orders messages across peers; Raft's terms
//!   and indexes do that job for the log.
//! - The mesh never touches consensus or storage. Everything it can't
//!   answer itself is handed to the node actor as a [`MeshEvent`].

pub mod mesh;
pub mod message;
pub mod peer;
pub mod sync;

pub use mesh::{Mesh, MeshConfig, MeshEvent};
pub use message::{
    read_frame, write_frame, Envelope, Handshake, HandshakeAck, Message, NetworkError,
    NetworkResult, PeerAddress, SyncRequest, SyncResponse,
};
pub use peer::{PeerInfo, PeerManager, PeerStatus, RejectReason};
pub use sync::{BlockSync, SyncBatch, SyncConfig, SyncError, SyncResult};
