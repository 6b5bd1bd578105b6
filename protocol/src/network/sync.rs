//! # Block Sync
//!
//! Catch-up for nodes that fall behind: after a restart, after a
//! partition, or on first boot against an existing cluster.
//!
//! ```text
//! Behind                                  Ahead
//! ──────                                  ─────
//!   │  SyncRequest { from_height, max }     │
//!   │──────────────────────────────────────>│
//!   │  SyncResponse { blocks, tip_height }  │
//!   │<──────────────────────────────────────│
//!   │  apply, repeat until caught up        │
//! ```
//!
//! ## Design Decisions
//!
//! - **The sync loop owns no chain.** Blocks go to the node actor through
//!   a [`SyncBatch`] with a reply channel, and the actor applies them like
//!   any other block. Only the sync task waits on the network; the actor
//!   never does.
//! - **Target choice.** Highest reported height wins; ties go to the
//!   lowest node id, so repeated selections within one run agree.
//! - **Timeouts pause, they don't retry.** A batch that doesn't answer in
//!   time ends the run. The next trigger (a pong or a new connection
//!   reporting a higher height) starts a fresh one.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::mesh::Mesh;
use super::message::{Message, NetworkError, SyncRequest, SyncResponse};
use super::peer::PeerInfo;
use crate::config::{MAX_FRAME_BYTES, SYNC_BATCH_SIZE, SYNC_REQUEST_TIMEOUT};
use crate::consensus::NodeId;
use crate::storage::{Block, LedgerDb, StorageError};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync request to {peer} timed out")]
    Timeout { peer: NodeId },

    #[error("sync request to {peer} was dropped")]
    Cancelled { peer: NodeId },

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("applying synced blocks failed: {0}")]
    Apply(String),

    #[error("node is shutting down")]
    Closed,
}

pub type SyncResult<T> = Result<T, SyncError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks per request.
    pub batch_size: u64,
    /// How long to wait for one batch.
    pub request_timeout: Duration,
    /// Cap on the serialized blocks in one response.
    pub max_response_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
            request_timeout: SYNC_REQUEST_TIMEOUT,
            max_response_bytes: MAX_FRAME_BYTES / 2,
        }
    }
}

/// Downloaded blocks on their way to the node actor. The actor answers with
/// its height after applying them.
#[derive(Debug)]
pub struct SyncBatch {
    pub peer: NodeId,
    pub blocks: Vec<Block>,
    pub reply: oneshot::Sender<Result<u64, String>>,
}

// ---------------------------------------------------------------------------
// BlockSync
// ---------------------------------------------------------------------------

/// Shared between the actor (which routes responses in) and sync runs
/// (which wait for them). Cheap to clone.
#[derive(Clone)]
pub struct BlockSync {
    config: SyncConfig,
    inflight: Arc<DashMap<u64, oneshot::Sender<SyncResponse>>>,
    next_request: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl BlockSync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            inflight: Arc::new(DashMap::new()),
            next_request: Arc::new(AtomicU64::new(1)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The connected peer with the highest height above `local_height`.
    /// Ties go to the lowest node id.
    pub fn select_target(peers: &[PeerInfo], local_height: u64) -> Option<(NodeId, u64)> {
        peers
            .iter()
            .filter(|p| p.height > local_height)
            .min_by(|a, b| b.height.cmp(&a.height).then_with(|| a.node_id.cmp(&b.node_id)))
            .map(|p| (p.node_id.clone(), p.height))
    }

    /// Hand a response to whichever run is waiting for it. Returns false for
    /// unknown or expired request ids.
    pub fn complete(&self, response: SyncResponse) -> bool {
        match self.inflight.remove(&response.request_id) {
            Some((_, waiter)) => waiter.send(response).is_ok(),
            None => false,
        }
    }

    /// Ask `peer` for blocks starting at `from_height`.
    pub async fn request_batch(
        &self,
        mesh: &Mesh,
        peer: &str,
        from_height: u64,
    ) -> SyncResult<SyncResponse> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(request_id, tx);

        let request = Message::SyncRequest(SyncRequest {
            request_id,
            from_height,
            max_blocks: self.config.batch_size,
        });
        if let Err(e) = mesh.send_to(peer, request) {
            self.inflight.remove(&request_id);
            return Err(e.into());
        }

        let outcome = tokio::time::timeout(self.config.request_timeout, rx).await;
        self.inflight.remove(&request_id);
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SyncError::Cancelled {
                peer: peer.to_string(),
            }),
            Err(_) => Err(SyncError::Timeout {
                peer: peer.to_string(),
            }),
        }
    }

    /// Start a run in the background unless one is already going.
    pub fn trigger(&self, mesh: Mesh, local_height: u64, apply: mpsc::Sender<SyncBatch>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let sync = self.clone();
        tokio::spawn(async move {
            match sync.run(&mesh, local_height, &apply).await {
                Ok(height) => debug!(height, "sync run finished"),
                Err(e) => warn!(error = %e, "sync run paused"),
            }
            sync.running.store(false, Ordering::SeqCst);
        });
    }

    /// Fetch and apply batches until no connected peer is ahead.
    pub async fn run(
        &self,
        mesh: &Mesh,
        mut local_height: u64,
        apply: &mpsc::Sender<SyncBatch>,
    ) -> SyncResult<u64> {
        loop {
            let peers = mesh.peers().connected();
            let Some((target, target_height)) = Self::select_target(&peers, local_height) else {
                return Ok(local_height);
            };
            info!(
                peer = %target,
                local_height,
                target_height,
                "syncing blocks"
            );

            let response = self.request_batch(mesh, &target, local_height + 1).await?;
            mesh.peers().update_height(&target, response.tip_height);
            if response.blocks.is_empty() {
                debug!(peer = %target, "empty sync response");
                return Ok(local_height);
            }

            let (reply, applied) = oneshot::channel();
            apply
                .send(SyncBatch {
                    peer: target.clone(),
                    blocks: response.blocks,
                    reply,
                })
                .await
                .map_err(|_| SyncError::Closed)?;
            let new_height = applied
                .await
                .map_err(|_| SyncError::Closed)?
                .map_err(SyncError::Apply)?;

            if new_height <= local_height {
                // No progress; don't spin on a peer serving unusable blocks.
                return Ok(local_height);
            }
            local_height = new_height;
        }
    }

    /// Answer a peer's request from local storage.
    pub fn serve(&self, db: &LedgerDb, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let tip_height = db.latest_height()?;
        let max = request.max_blocks.clamp(1, self.config.batch_size.max(1));
        let mut blocks = Vec::new();
        if request.from_height <= tip_height {
            let end = request
                .from_height
                .saturating_add(max - 1)
                .min(tip_height);
            let mut budget = self.config.max_response_bytes;
            for block in db.get_block_range(request.from_height, end)? {
                let size = serde_json::to_vec(&block)
                    .map(|b| b.len())
                    .unwrap_or(usize::MAX);
                if size > budget && !blocks.is_empty() {
                    break;
                }
                budget = budget.saturating_sub(size);
                blocks.push(block);
            }
        }
        Ok(SyncResponse {
            request_id: request.request_id,
            blocks,
            tip_height,
        })
    }
}

impl std::fmt::Debug for BlockSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSync")
            .field("running", &self.is_running())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::NodeKeypair;
    use crate::network::peer::PeerStatus;
    use crate::storage::{BlockLimits, Chain};

    fn peer(id: &str, height: u64) -> PeerInfo {
        PeerInfo {
            node_id: id.into(),
            public_key: String::new(),
            organization: String::new(),
            address: String::new(),
            status: PeerStatus::Connected,
            height,
            connected_at: 0,
        }
    }

    #[test]
    fn target_is_highest_then_lowest_id() {
        let peers = vec![peer("c", 9), peer("b", 9), peer("a", 3)];
        assert_eq!(
            BlockSync::select_target(&peers, 5),
            Some(("b".to_string(), 9))
        );
        assert_eq!(BlockSync::select_target(&peers, 9), None);
        assert_eq!(BlockSync::select_target(&[], 0), None);
    }

    fn chain_with(blocks: u64) -> Chain {
        let db = std::sync::Arc::new(LedgerDb::open_temporary().unwrap());
        let mut chain = Chain::load(db).unwrap();
        let node = NodeKeypair::generate();
        let limits = BlockLimits {
            max_transactions: 10,
            max_bytes: 1 << 16,
        };
        for _ in 0..blocks {
            let tip = chain.tip();
            let sim = chain
                .db()
                .simulate(&[], &[], tip.height + 1, tip.timestamp, limits)
                .unwrap();
            let mut block = chain.propose_block(vec![], node.public_key_hex(), sim.state_root);
            block.sign(&node);
            chain.append_block(&block).unwrap();
        }
        chain
    }

    #[test]
    fn serve_respects_batch_and_tip() {
        let chain = chain_with(7);
        let sync = BlockSync::new(SyncConfig {
            batch_size: 3,
            ..SyncConfig::default()
        });

        let resp = sync
            .serve(
                chain.db(),
                &SyncRequest {
                    request_id: 1,
                    from_height: 2,
                    max_blocks: 50,
                },
            )
            .unwrap();
        let heights: Vec<u64> = resp.blocks.iter().map(|b| b.height()).collect();
        assert_eq!(heights, vec![2, 3, 4]);
        assert_eq!(resp.tip_height, 7);

        let past_tip = sync
            .serve(
                chain.db(),
                &SyncRequest {
                    request_id: 2,
                    from_height: 8,
                    max_blocks: 3,
                },
            )
            .unwrap();
        assert!(past_tip.blocks.is_empty());
    }

    #[test]
    fn serve_caps_response_bytes() {
        let chain = chain_with(5);
        let sync = BlockSync::new(SyncConfig {
            max_response_bytes: 1,
            ..SyncConfig::default()
        });
        let resp = sync
            .serve(
                chain.db(),
                &SyncRequest {
                    request_id: 1,
                    from_height: 1,
                    max_blocks: 50,
                },
            )
            .unwrap();
        // Always at least one block, so progress is possible.
        assert_eq!(resp.blocks.len(), 1);
    }

    #[tokio::test]
    async fn complete_routes_to_waiter_once() {
        let sync = BlockSync::new(SyncConfig::default());
        let (tx, rx) = oneshot::channel();
        sync.inflight.insert(7, tx);
        let response = SyncResponse {
            request_id: 7,
            blocks: vec![],
            tip_height: 3,
        };
        assert!(sync.complete(response.clone()));
        assert_eq!(rx.await.unwrap().tip_height, 3);
        assert!(!sync.complete(response));
    }
}
