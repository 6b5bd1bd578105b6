//! # Protocol Configuration & Constants
//!
//! Every magic number lives here. Runtime-tunable knobs live in the config
//! struct of the component that owns them (`RaftConfig`, `MeshConfig`,
//! `SyncConfig`, `ExecutionConfig`, `NodeConfig`) and take their defaults
//! from the constants below.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate version string.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version carried in every wire envelope. Peers speaking a different
/// version are dropped at the handshake.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Networking
// ---------------------------------------------------------------------------

/// Default TCP port for the peer mesh.
pub const DEFAULT_P2P_PORT: u16 = 7400;

/// Largest frame accepted from a peer. Anything bigger is a protocol error
/// and closes the connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Interval between health-check pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for the handshake exchange on a fresh connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on simultaneously connected peers.
pub const MAX_PEERS: usize = 64;

/// Outbound queue depth per peer connection.
pub const PEER_SEND_QUEUE: usize = 1024;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Blocks requested per sync batch.
pub const SYNC_BATCH_SIZE: u64 = 50;

/// How long a sync batch request may take before that batch is abandoned.
pub const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Lower bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(1_500);

/// Upper bound of the randomized election timeout.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(3_000);

/// Leader heartbeat period. Must be well below the election timeout.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum log entries shipped in one AppendEntries. Together with
/// [`MAX_BLOCK_BYTES`] this keeps a full AppendEntries inside one frame.
pub const MAX_ENTRIES_PER_APPEND: usize = 16;

/// How often the node actor drives Raft timers.
pub const CONSENSUS_TICK: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Blocks & Transactions
// ---------------------------------------------------------------------------

/// Leader block production cadence.
pub const BLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum transactions per block.
pub const MAX_TXS_PER_BLOCK: usize = 500;

/// Block body budget used by the proposer when packing transactions.
pub const MAX_BLOCK_BYTES: usize = 512 * 1024;

/// Largest serialized transaction accepted.
pub const MAX_TX_BYTES: usize = 64 * 1024;

/// Largest world-state key.
pub const MAX_KEY_BYTES: usize = 256;

/// Key prefixes that only the executor itself writes.
pub const RESERVED_KEY_PREFIXES: &[&str] = &["contract:", "governance:", "acl:"];

// ---------------------------------------------------------------------------
// Contract Execution
// ---------------------------------------------------------------------------

/// Wall-clock budget for a single contract invocation.
pub const CONTRACT_TIME_BUDGET: Duration = Duration::from_secs(5);

/// Deterministic op budget for a single contract invocation.
pub const CONTRACT_FUEL: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_below_election_timeout() {
        assert!(HEARTBEAT_INTERVAL < ELECTION_TIMEOUT_MIN);
        assert!(ELECTION_TIMEOUT_MIN < ELECTION_TIMEOUT_MAX);
    }

    #[test]
    fn full_append_entries_fits_in_a_frame() {
        assert!(MAX_BLOCK_BYTES * MAX_ENTRIES_PER_APPEND < MAX_FRAME_BYTES);
        assert!(MAX_TX_BYTES < MAX_BLOCK_BYTES);
    }
}
