//! # Node
//!
//! The embeddable node: storage, chain, Raft and the peer mesh wired
//! together behind a cloneable [`NodeHandle`].
//!
//! ```text
//!   NodeHandle ──commands──▶ ┌──────────────┐ ◀──MeshEvent── Mesh
//!        ▲                   │  node actor  │ ◀──SyncBatch── BlockSync
//!        └──events/status─── └──────┬───────┘
//!                                   │ Apply(entry), in index order
//!                                   ▼
//!                              Chain / LedgerDb
//! ```
//!
//! ## Design Decisions
//!
//! - **One actor owns the mutable state.** The Raft state machine, the
//!   chain tip and the apply queue live in a single task. Commands, mesh
//!   events, sync batches and timers are multiplexed with `tokio::select!`,
//!   so there is no lock around consensus at all. Reads that don't need the
//!   actor (blocks, state, queries) go straight to [`LedgerDb`].
//! - **Solo is Raft with one voter.** A solo node pins its voter set to
//!   itself and campaigns at startup. Blocks still go through the log and
//!   the same commit path.
//! - **Log index is not block height.** Committed entries are queued and
//!   applied by height: entries at or below the chain height are skipped,
//!   and an entry above `height + 1` parks the queue until sync fills the
//!   gap.
//! - **One proposal in flight.** The leader packs the next block on top of
//!   its own uncommitted entries, but only after the previous current-term
//!   entry commits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BLOCK_INTERVAL, CONSENSUS_TICK, MAX_BLOCK_BYTES, MAX_TXS_PER_BLOCK};
use crate::consensus::{LogEntry, NodeId, RaftAction, RaftConfig, RaftError, RaftNode, Role, SledRaftLog};
use crate::contract::{ExecutionConfig, ScriptRuntime};
use crate::crypto::keys::{node_id_from_hex, NodeKeypair};
use crate::network::{
    BlockSync, Mesh, MeshConfig, MeshEvent, Message, NetworkError, PeerInfo, SyncBatch,
    SyncConfig,
};
use crate::storage::executor::read_members;
use crate::storage::{
    AppliedBlock, Block, BlockLimits, Chain, ChainError, ChainTip, ExecutionError, Executor,
    LedgerDb, QueryError, StateOverlay, StorageError, WorldStateEntry,
};
use crate::transaction::{verify_transaction, Receipt, Transaction, TransactionStatus, TxValidationError};

const COMMAND_QUEUE: usize = 256;
const MESH_EVENT_QUEUE: usize = 4096;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid transaction: {0}")]
    Invalid(#[from] TxValidationError),

    #[error("nonce {nonce} from {sender} already used (next is {next})")]
    NonceUsed { sender: String, nonce: u64, next: u64 },

    #[error("a pending transaction from {sender} already uses nonce {nonce}")]
    NonceConflict { sender: String, nonce: u64 },

    #[error("transaction {0} is already known")]
    Duplicate(String),

    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("storage is halted, writes are refused")]
    Halted,

    #[error("node has stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Raft(#[from] RaftError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

pub type NodeResult<T> = Result<T, NodeError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Single voter. Peers may still connect, gossip and sync.
    Solo,
    /// Replicated across the configured voters.
    Raft,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Solo => write!(f, "solo"),
            Self::Raft => write!(f, "raft"),
        }
    }
}

impl FromStr for Mode {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "solo" => Ok(Self::Solo),
            "raft" => Ok(Self::Raft),
            other => Err(NodeError::Config(format!("unknown mode {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Database directory. `None` runs on a temporary database that is
    /// removed on drop.
    pub data_dir: Option<PathBuf>,
    pub mode: Mode,
    /// Node ids of the other Raft voters. The local node is always added.
    /// Ignored in solo mode.
    pub voters: Vec<NodeId>,
    pub mesh: MeshConfig,
    /// `initial_voters` is filled in from `mode` and `voters`.
    pub raft: RaftConfig,
    pub sync: SyncConfig,
    pub execution: ExecutionConfig,
    /// How often the leader tries to cut a block.
    pub block_interval: Duration,
    /// Consensus timer resolution.
    pub tick_interval: Duration,
    pub max_txs_per_block: usize,
    pub max_block_bytes: usize,
    /// Buffered events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            mode: Mode::Solo,
            voters: Vec::new(),
            mesh: MeshConfig::default(),
            raft: RaftConfig::default(),
            sync: SyncConfig::default(),
            execution: ExecutionConfig::default(),
            block_interval: BLOCK_INTERVAL,
            tick_interval: CONSENSUS_TICK,
            max_txs_per_block: MAX_TXS_PER_BLOCK,
            max_block_bytes: MAX_BLOCK_BYTES,
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> NodeResult<()> {
        if self.raft.election_timeout_min >= self.raft.election_timeout_max {
            return Err(NodeError::Config(
                "election_timeout_min must be below election_timeout_max".into(),
            ));
        }
        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return Err(NodeError::Config(
                "heartbeat_interval must be below the election timeout".into(),
            ));
        }
        if self.block_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(NodeError::Config("intervals must be non-zero".into()));
        }
        if self.max_txs_per_block == 0 || self.event_capacity == 0 {
            return Err(NodeError::Config(
                "max_txs_per_block and event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Voter set to start Raft with when none is persisted.
    fn initial_voters(&self, local: &str) -> Vec<NodeId> {
        let mut voters = vec![local.to_string()];
        if self.mode == Mode::Raft {
            for voter in &self.voters {
                if !voters.contains(voter) {
                    voters.push(voter.clone());
                }
            }
        }
        voters
    }
}

/// The voter set implied by the governance member list.
///
/// `configured` is a floor: membership changes never remove those nodes.
/// A member becomes a voter only if it is a node this one can vouch for,
/// either a voter already or a connected, handshaken peer; client keys
/// never vote. A former member drops out unless it is configured.
/// The result is sorted.
fn governed_voters(
    configured: &[NodeId],
    current: &[NodeId],
    connected: &[NodeId],
    members: &[NodeId],
) -> Vec<NodeId> {
    let mut voters: Vec<NodeId> = configured.to_vec();
    voters.extend(
        members
            .iter()
            .filter(|m| current.contains(m) || connected.contains(m))
            .cloned(),
    );
    voters.sort();
    voters.dedup();
    voters
}

// ---------------------------------------------------------------------------
// Events & Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Emitted before the `TxConfirmed` events of the block's transactions.
    BlockCommitted(Block),
    TxConfirmed { hash: String, block_height: u64 },
    TxRejected { hash: String, reason: String },
    PeerConnected(PeerInfo),
    PeerDisconnected { node_id: NodeId },
    LeaderElected { leader_id: NodeId, term: u64 },
    QuorumChanged { available: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub mode: Mode,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub height: u64,
    pub tip_hash: String,
    pub commit_index: u64,
    pub last_applied: u64,
    pub peers: usize,
    pub voters: Vec<NodeId>,
    pub quorum_available: bool,
    pub pending: usize,
    pub halted: bool,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum Command {
    Submit {
        tx: Transaction,
        reply: oneshot::Sender<NodeResult<Receipt>>,
    },
    ProduceBlock {
        reply: oneshot::Sender<NodeResult<Option<u64>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap to clone. Every clone talks to the same actor.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    public_key: String,
    p2p_addr: String,
    db: Arc<LedgerDb>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
    status: watch::Receiver<NodeStatus>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Address peers can dial.
    pub fn p2p_addr(&self) -> &str {
        &self.p2p_addr
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    /// Validate and queue a transaction. Returns once it is in the pending
    /// pool, not once it is confirmed.
    pub async fn submit(&self, tx: Transaction) -> NodeResult<Receipt> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { tx, reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Ask the leader to cut a block now, even an empty one. Returns the
    /// proposed height, or `None` if a proposal is already in flight.
    pub async fn produce_block(&self) -> NodeResult<Option<u64>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ProduceBlock { reply })
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// Stop the actor and the mesh and flush storage. Idempotent.
    pub async fn shutdown(&self) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> NodeResult<Vec<Map<String, Value>>> {
        Ok(self.db.query(sql, params)?)
    }

    pub fn get_block(&self, height: u64) -> NodeResult<Option<Block>> {
        Ok(self.db.get_block(height)?)
    }

    pub fn get_latest_block(&self) -> NodeResult<Block> {
        Ok(self.db.latest_block()?)
    }

    pub fn get_state(&self, key: &str) -> NodeResult<Option<WorldStateEntry>> {
        Ok(self.db.get_state(key)?)
    }

    pub fn transaction_status(&self, hash: &str) -> NodeResult<Option<TransactionStatus>> {
        Ok(self.db.transaction_status(hash)?)
    }

    /// Next nonce a new transaction from `sender` should carry, counting
    /// the sender's pending transactions.
    pub fn next_nonce(&self, sender: &str) -> NodeResult<u64> {
        let mut next = self.db.get_next_nonce(sender)?;
        for tx in self.db.pending_transactions()? {
            if tx.sender == sender && tx.nonce >= next {
                next = tx.nonce + 1;
            }
        }
        Ok(next)
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Wait until the local chain reaches `height`. False on timeout.
    pub async fn wait_for_height(&self, height: u64, limit: Duration) -> bool {
        let mut status = self.status.clone();
        tokio::time::timeout(limit, async move {
            loop {
                if status.borrow_and_update().height >= height {
                    return;
                }
                if status.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

pub struct Node;

impl Node {
    /// Open storage, load the chain, start the mesh and spawn the actor.
    pub async fn start(config: NodeConfig, keypair: NodeKeypair) -> NodeResult<NodeHandle> {
        config.validate()?;
        let node_id = keypair.node_id();

        let executor = Executor::new(Arc::new(ScriptRuntime::new(config.execution.clone())));
        let db = match &config.data_dir {
            Some(dir) => LedgerDb::open(dir)?,
            None => LedgerDb::open_temporary()?,
        };
        let db = Arc::new(db.with_executor(executor));
        let chain = Chain::load(db.clone())?;

        let mut raft_config = config.raft.clone();
        raft_config.initial_voters = config.initial_voters(&node_id);
        let log = SledRaftLog::open(&db)?;
        let raft = RaftNode::new(node_id.clone(), raft_config, log, Instant::now())?;

        let (mesh_tx, mesh_rx) = mpsc::channel(MESH_EVENT_QUEUE);
        let mesh = Mesh::start(config.mesh.clone(), &keypair, mesh_tx).await?;
        mesh.set_height(chain.height());

        let (events, _) = broadcast::channel(config.event_capacity);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (sync_tx, sync_rx) = mpsc::channel(4);
        let tip = chain.tip();
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            node_id: node_id.clone(),
            mode: config.mode,
            role: raft.role(),
            term: raft.term(),
            leader_id: None,
            height: tip.height,
            tip_hash: hex::encode(tip.hash),
            commit_index: raft.commit_index(),
            last_applied: raft.last_applied(),
            peers: 0,
            voters: raft.voters().iter().cloned().collect(),
            quorum_available: config.mode == Mode::Solo,
            pending: db.pending_count(),
            halted: db.is_halted(),
        });

        info!(
            node = %node_id,
            mode = %config.mode,
            height = tip.height,
            term = raft.term(),
            voters = raft.voters().len(),
            p2p = %mesh.advertise_addr(),
            "node starting"
        );

        let handle = NodeHandle {
            node_id: node_id.clone(),
            public_key: keypair.public_key_hex(),
            p2p_addr: mesh.advertise_addr().to_string(),
            db: db.clone(),
            commands: command_tx,
            events: events.clone(),
            status: status_rx,
        };

        let mut actor = NodeActor {
            node_id,
            quorum_available: config.mode == Mode::Solo,
            sync: BlockSync::new(config.sync.clone()),
            config,
            keypair,
            db,
            chain,
            raft,
            mesh,
            apply_queue: VecDeque::new(),
            wants_proposal: false,
            commands: command_rx,
            mesh_events: mesh_rx,
            sync_tx,
            sync_batches: sync_rx,
            events,
            status: status_tx,
        };
        actor.bootstrap()?;
        actor.publish_status();
        tokio::spawn(actor.run());
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct NodeActor {
    node_id: NodeId,
    config: NodeConfig,
    keypair: NodeKeypair,
    db: Arc<LedgerDb>,
    chain: Chain,
    raft: RaftNode<SledRaftLog>,
    mesh: Mesh,
    sync: BlockSync,
    /// Committed entries not yet applied, in index order.
    apply_queue: VecDeque<LogEntry>,
    /// Try to cut a block at the end of this loop iteration.
    wants_proposal: bool,
    quorum_available: bool,
    commands: mpsc::Receiver<Command>,
    mesh_events: mpsc::Receiver<MeshEvent>,
    sync_tx: mpsc::Sender<SyncBatch>,
    sync_batches: mpsc::Receiver<SyncBatch>,
    events: broadcast::Sender<NodeEvent>,
    status: watch::Sender<NodeStatus>,
}

impl NodeActor {
    fn bootstrap(&mut self) -> NodeResult<()> {
        let now = Instant::now();
        match self.config.mode {
            Mode::Solo => {
                let actions = self.raft.set_voters(vec![self.node_id.clone()], now)?;
                self.run_actions(actions);
                let actions = self.raft.campaign(now)?;
                self.run_actions(actions);
            }
            Mode::Raft => {
                self.refresh_voters()?;
                self.drain_apply_queue();
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut block_timer = tokio::time::interval(self.config.block_interval);
        block_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit { tx, reply }) => {
                        let _ = reply.send(self.submit(tx));
                    }
                    Some(Command::ProduceBlock { reply }) => {
                        let _ = reply.send(self.produce_block());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = self.mesh_events.recv() => self.on_mesh_event(event),
                Some(batch) = self.sync_batches.recv() => self.on_sync_batch(batch),
                _ = tick.tick() => self.on_tick(),
                _ = block_timer.tick() => self.wants_proposal = true,
            }

            if std::mem::take(&mut self.wants_proposal) {
                if let Err(e) = self.try_propose(false) {
                    warn!(error = %e, "block proposal failed");
                }
            }
            self.publish_status();
        }
    }

    fn stop(&mut self) {
        self.mesh.shutdown();
        if let Err(e) = self.db.flush() {
            warn!(error = %e, "flush on shutdown failed");
        }
        info!(node = %self.node_id, height = self.chain.height(), "node stopped");
    }

    // -- Raft plumbing -------------------------------------------------------

    /// Carry out actions, then apply whatever became committed.
    fn run_actions(&mut self, actions: Vec<RaftAction>) {
        self.dispatch(actions);
        self.drain_apply_queue();
    }

    fn dispatch(&mut self, actions: Vec<RaftAction>) {
        for action in actions {
            match action {
                RaftAction::Send { to, message } => {
                    if let Err(e) = self.mesh.send_to(&to, message.into()) {
                        trace!(peer = %to, error = %e, "raft message not delivered");
                    }
                }
                RaftAction::Apply(entry) => self.apply_queue.push_back(entry),
                RaftAction::LeaderChanged { leader_id, term } => {
                    self.on_leader_changed(leader_id, term)
                }
            }
        }
    }

    fn on_leader_changed(&mut self, leader_id: Option<NodeId>, term: u64) {
        let Some(leader) = leader_id else {
            debug!(term, "leader unknown");
            return;
        };
        info!(leader = %leader, term, "leader elected");
        self.emit(NodeEvent::LeaderElected {
            leader_id: leader.clone(),
            term,
        });
        if leader == self.node_id {
            self.wants_proposal = true;
        } else {
            self.forward_pool_to(&leader);
        }
    }

    fn on_tick(&mut self) {
        match self.raft.tick(Instant::now()) {
            Ok(actions) => self.run_actions(actions),
            Err(e) => error!(error = %e, "raft tick failed"),
        }
        self.update_quorum();
    }

    /// Apply queued entries in order until the queue is empty or blocked on
    /// a gap.
    fn drain_apply_queue(&mut self) {
        while let Some(front) = self.apply_queue.front() {
            let height = front.block.height();
            let local = self.chain.height();
            if height > local + 1 {
                debug!(
                    index = front.index,
                    height, local, "committed block ahead of chain, waiting for sync"
                );
                self.start_sync();
                return;
            }
            let Some(entry) = self.apply_queue.pop_front() else {
                return;
            };
            if height <= local {
                self.check_known_block(&entry.block);
                continue;
            }
            if !self.apply_block(&entry.block, "log") {
                // Leave the chain where it is; a later entry or sync will
                // bring the right block.
                warn!(index = entry.index, height, "committed entry not applied");
            }
        }
    }

    /// A committed entry at or below our height must be the block we
    /// already have.
    fn check_known_block(&self, block: &Block) {
        match self.db.get_block(block.height()) {
            Ok(Some(stored)) if stored.hash() != block.hash() => error!(
                height = block.height(),
                stored = %stored.hash_hex(),
                committed = %block.hash_hex(),
                "committed entry conflicts with the local chain"
            ),
            Ok(_) => trace!(height = block.height(), "entry already applied"),
            Err(e) => warn!(error = %e, "block lookup failed"),
        }
    }

    fn apply_block(&mut self, block: &Block, source: &'static str) -> bool {
        match self.chain.append_block(block) {
            Ok(applied) => {
                self.after_block(block, applied);
                true
            }
            Err(ChainError::AlreadyApplied(_)) => false,
            Err(e) if e.is_fatal() => {
                error!(height = block.height(), source, error = %e, "storage failure, node halted");
                false
            }
            Err(e) => {
                warn!(height = block.height(), source, error = %e, "block not applied");
                false
            }
        }
    }

    fn after_block(&mut self, block: &Block, applied: AppliedBlock) {
        let height = applied.height;
        info!(
            height,
            hash = %hex::encode(applied.hash),
            txs = applied.confirmed.len(),
            "block committed"
        );
        self.mesh.set_height(height);
        self.emit(NodeEvent::BlockCommitted(block.clone()));
        for hash in applied.confirmed {
            self.emit(NodeEvent::TxConfirmed {
                hash,
                block_height: height,
            });
        }
        if self.raft.is_leader() {
            self.mesh.broadcast(Message::BlockAnnounce {
                height,
                hash: block.hash_hex(),
            });
        }
        if block
            .transactions
            .iter()
            .any(|tx| tx.payload.touches_membership())
        {
            if let Err(e) = self.refresh_voters() {
                warn!(error = %e, "voter refresh failed");
            }
            self.update_quorum();
        }
        self.prune_pending();
    }

    /// Follow the governance member list, if there is one. Raft mode only.
    fn refresh_voters(&mut self) -> NodeResult<()> {
        if self.config.mode != Mode::Raft {
            return Ok(());
        }
        let overlay = StateOverlay::new(self.db.as_ref());
        let members: Vec<NodeId> = read_members(&overlay)?
            .iter()
            .filter_map(|pk| node_id_from_hex(pk))
            .collect();
        if members.is_empty() {
            return Ok(());
        }
        let current: Vec<NodeId> = self.raft.voters().iter().cloned().collect();
        let voters = governed_voters(
            &self.config.initial_voters(&self.node_id),
            &current,
            &self.mesh.peers().connected_ids(),
            &members,
        );
        if voters != current {
            debug!(from = ?current, to = ?voters, "voters follow governance");
        }
        let actions = self.raft.set_voters(voters, Instant::now())?;
        self.dispatch(actions);
        Ok(())
    }

    /// Drop pending transactions whose nonce a committed block used up.
    fn prune_pending(&mut self) {
        let pending = match self.db.pending_transactions() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending pool unreadable");
                return;
            }
        };
        for tx in pending {
            let Ok(next) = self.db.get_next_nonce(&tx.sender) else {
                continue;
            };
            if tx.nonce >= next {
                continue;
            }
            let reason = format!("nonce {} already used (next is {})", tx.nonce, next);
            match self.db.reject_transaction(&tx.hash, &reason) {
                Ok(()) => self.emit(NodeEvent::TxRejected {
                    hash: tx.hash,
                    reason,
                }),
                Err(e) => warn!(tx = %tx.hash, error = %e, "could not reject transaction"),
            }
        }
    }

    // -- Proposals -----------------------------------------------------------

    fn produce_block(&mut self) -> NodeResult<Option<u64>> {
        if !self.raft.is_leader() {
            return Err(NodeError::NotLeader {
                leader: self.raft.leader_id().cloned(),
            });
        }
        self.try_propose(true)
    }

    /// Pack and propose the next block if this node leads and nothing of
    /// its own term is in flight. Without `force`, an empty block is only
    /// cut to commit entries left over from earlier terms.
    fn try_propose(&mut self, force: bool) -> NodeResult<Option<u64>> {
        if !self.raft.is_leader() || self.raft.has_inflight_proposal() {
            return Ok(None);
        }
        if self.db.is_halted() {
            return Err(NodeError::Halted);
        }

        let local = self.chain.tip();
        let ancestors: Vec<Block> = self
            .raft
            .uncommitted_entries()?
            .into_iter()
            .map(|entry| entry.block)
            .filter(|block| block.height() > local.height)
            .collect();
        if let Some(first) = ancestors.first() {
            if first.height() != local.height + 1 {
                debug!(
                    first = first.height(),
                    local = local.height,
                    "uncommitted entries don't extend the chain yet"
                );
                return Ok(None);
            }
        }
        let parent = ancestors.last().map(ChainTip::of).unwrap_or(local);

        let in_flight: HashSet<&str> = ancestors
            .iter()
            .flat_map(|block| block.transactions.iter().map(|tx| tx.hash.as_str()))
            .collect();
        let candidates: Vec<Transaction> = self
            .db
            .pending_transactions()?
            .into_iter()
            .filter(|tx| !in_flight.contains(tx.hash.as_str()))
            .collect();
        let uncommitted = self.raft.last_log_index() > self.raft.commit_index();
        if candidates.is_empty() && !uncommitted && !force {
            return Ok(None);
        }

        let height = parent.height + 1;
        let timestamp = Chain::next_timestamp(&parent);
        let limits = BlockLimits {
            max_transactions: self.config.max_txs_per_block,
            max_bytes: self.config.max_block_bytes,
        };
        let simulation = self
            .db
            .simulate(&ancestors, &candidates, height, timestamp, limits)?;
        for (tx, reason) in simulation.rejected {
            self.db.reject_transaction(&tx.hash, &reason)?;
            debug!(tx = %tx.hash, reason = %reason, "transaction rejected while packing");
            self.emit(NodeEvent::TxRejected {
                hash: tx.hash,
                reason,
            });
        }
        if simulation.included.is_empty() && !uncommitted && !force {
            return Ok(None);
        }

        let mut block = Chain::assemble(
            parent,
            timestamp,
            simulation.included,
            self.keypair.public_key_hex(),
            simulation.state_root,
        );
        block.sign(&self.keypair);
        info!(
            height,
            txs = block.tx_count(),
            deferred = simulation.deferred,
            term = self.raft.term(),
            "proposing block"
        );
        let (index, actions) = self.raft.propose(block, Instant::now())?;
        debug!(index, height, "block entry appended");
        self.run_actions(actions);
        Ok(Some(height))
    }

    // -- Transactions --------------------------------------------------------

    /// Checks shared by local submission and gossip. `Ok(false)` means the
    /// transaction was already pending.
    fn admit(&self, tx: &Transaction) -> NodeResult<bool> {
        if self.db.is_halted() {
            return Err(NodeError::Halted);
        }
        verify_transaction(tx)?;
        if self.db.get_transaction(&tx.hash)?.is_some() {
            return Err(NodeError::Duplicate(tx.hash.clone()));
        }
        if self.db.contains_pending(&tx.hash)? {
            return Ok(false);
        }
        let next = self.db.get_next_nonce(&tx.sender)?;
        if tx.nonce < next {
            return Err(NodeError::NonceUsed {
                sender: tx.sender.clone(),
                nonce: tx.nonce,
                next,
            });
        }
        if self.db.pending_has_nonce(&tx.sender, tx.nonce)? {
            return Err(NodeError::NonceConflict {
                sender: tx.sender.clone(),
                nonce: tx.nonce,
            });
        }
        Ok(self.db.add_pending(tx)?)
    }

    fn submit(&mut self, tx: Transaction) -> NodeResult<Receipt> {
        if !self.admit(&tx)? {
            return Err(NodeError::Duplicate(tx.hash));
        }
        info!(tx = %tx.hash, nonce = tx.nonce, kind = %tx.tx_type(), "transaction accepted");
        self.mesh.broadcast(Message::TxBroadcast {
            transaction: tx.clone(),
        });
        self.route_to_leader(&tx);
        Ok(Receipt {
            hash: tx.hash,
            status: TransactionStatus::Pending,
        })
    }

    fn route_to_leader(&self, tx: &Transaction) {
        if self.config.mode == Mode::Solo || self.raft.is_leader() {
            return;
        }
        // With no known leader the transaction waits in the pool and goes
        // out with the next leader change.
        if let Some(leader) = self.raft.leader_id() {
            let forward = Message::TxForward {
                transaction: tx.clone(),
            };
            if let Err(e) = self.mesh.send_to(leader, forward) {
                debug!(leader = %leader, error = %e, "forward to leader failed");
            }
        }
    }

    fn forward_pool_to(&self, leader: &str) {
        if self.config.mode == Mode::Solo {
            return;
        }
        let pending = match self.db.pending_transactions() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending pool unreadable");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        debug!(leader, count = pending.len(), "forwarding pending pool to new leader");
        for transaction in pending {
            if self
                .mesh
                .send_to(leader, Message::TxForward { transaction })
                .is_err()
            {
                break;
            }
        }
    }

    fn intake_remote(&mut self, from: &str, tx: Transaction, gossip: bool) {
        match self.admit(&tx) {
            Ok(true) => {
                debug!(tx = %tx.hash, peer = from, "transaction received");
                if gossip {
                    self.mesh.broadcast(Message::TxBroadcast {
                        transaction: tx.clone(),
                    });
                }
                if self.raft.is_leader() {
                    self.wants_proposal = true;
                } else {
                    self.route_to_leader(&tx);
                }
            }
            Ok(false) => {}
            Err(e) => trace!(tx = %tx.hash, peer = from, error = %e, "remote transaction dropped"),
        }
    }

    // -- Mesh ----------------------------------------------------------------

    fn on_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::PeerConnected(peer) => {
                if peer.height > self.chain.height() {
                    self.start_sync();
                }
                // A member node that was unreachable when it joined.
                if !self.raft.voters().contains(&peer.node_id) {
                    if let Err(e) = self.refresh_voters() {
                        warn!(error = %e, "voter refresh failed");
                    }
                    self.drain_apply_queue();
                }
                if self.raft.is_leader() {
                    self.wants_proposal = true;
                }
                self.emit(NodeEvent::PeerConnected(peer));
                self.update_quorum();
            }
            MeshEvent::PeerDisconnected { node_id } => {
                self.emit(NodeEvent::PeerDisconnected { node_id });
                self.update_quorum();
            }
            MeshEvent::Message { from, message } => self.on_message(from, message),
        }
    }

    fn on_message(&mut self, from: NodeId, message: Message) {
        let message = match message.into_raft() {
            Ok(rpc) => {
                if self.config.mode == Mode::Solo {
                    trace!(peer = %from, "raft message ignored in solo mode");
                    return;
                }
                match self.raft.handle_message(&from, rpc, Instant::now()) {
                    Ok(actions) => self.run_actions(actions),
                    Err(e) => error!(peer = %from, error = %e, "raft message failed"),
                }
                return;
            }
            Err(other) => other,
        };

        match message {
            Message::TxBroadcast { transaction } => self.intake_remote(&from, transaction, true),
            Message::TxForward { transaction } => self.intake_remote(&from, transaction, false),
            Message::BlockAnnounce { height, hash } => {
                let local = self.chain.height();
                if height == local + 1 {
                    trace!(peer = %from, height, hash = %hash, "fetching announced block");
                    self.send(&from, Message::BlockRequest { height });
                } else if height > local + 1 {
                    self.start_sync();
                }
            }
            Message::BlockRequest { height } => {
                let block = self.db.get_block(height).unwrap_or_else(|e| {
                    warn!(height, error = %e, "block lookup failed");
                    None
                });
                self.send(&from, Message::BlockResponse { height, block });
            }
            Message::BlockResponse {
                block: Some(block), ..
            } => {
                if block.height() == self.chain.height() + 1 && self.apply_block(&block, "announce")
                {
                    self.drain_apply_queue();
                }
            }
            Message::BlockResponse { block: None, height } => {
                trace!(peer = %from, height, "peer has no such block");
            }
            Message::SyncRequest(request) => match self.sync.serve(&self.db, &request) {
                Ok(response) => self.send(&from, Message::SyncResponse(response)),
                Err(e) => warn!(peer = %from, error = %e, "could not serve sync request"),
            },
            Message::SyncResponse(response) => {
                let request_id = response.request_id;
                if !self.sync.complete(response) {
                    debug!(peer = %from, request_id, "stale sync response");
                }
            }
            Message::Pong { height } => {
                if height > self.chain.height() {
                    self.start_sync();
                }
            }
            other => trace!(peer = %from, kind = other.kind(), "unexpected message"),
        }
    }

    fn send(&self, to: &str, message: Message) {
        if let Err(e) = self.mesh.send_to(to, message) {
            debug!(peer = to, error = %e, "send failed");
        }
    }

    fn start_sync(&self) {
        self.sync
            .trigger(self.mesh.clone(), self.chain.height(), self.sync_tx.clone());
    }

    fn on_sync_batch(&mut self, batch: SyncBatch) {
        let mut outcome = Ok(self.chain.height());
        for block in &batch.blocks {
            if block.height() <= self.chain.height() {
                continue;
            }
            match self.chain.append_block(block) {
                Ok(applied) => {
                    self.after_block(block, applied);
                    outcome = Ok(self.chain.height());
                }
                Err(e) => {
                    warn!(peer = %batch.peer, height = block.height(), error = %e, "synced block rejected");
                    outcome = Err(e.to_string());
                    break;
                }
            }
        }
        let _ = batch.reply.send(outcome);
        self.drain_apply_queue();
    }

    fn update_quorum(&mut self) {
        let available = match self.config.mode {
            Mode::Solo => true,
            Mode::Raft => {
                let peers = self.mesh.peers();
                let reachable = self
                    .raft
                    .voters()
                    .iter()
                    .filter(|v| **v == self.node_id || peers.is_connected(v))
                    .count();
                reachable >= self.raft.quorum()
            }
        };
        if available == self.quorum_available {
            return;
        }
        self.quorum_available = available;
        if available {
            info!(voters = self.raft.voters().len(), "quorum available");
        } else {
            warn!(voters = self.raft.voters().len(), "quorum lost");
        }
        self.emit(NodeEvent::QuorumChanged { available });
    }

    // -- Output --------------------------------------------------------------

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        let tip = self.chain.tip();
        let status = NodeStatus {
            node_id: self.node_id.clone(),
            mode: self.config.mode,
            role: self.raft.role(),
            term: self.raft.term(),
            leader_id: self.raft.leader_id().cloned(),
            height: tip.height,
            tip_hash: hex::encode(tip.hash),
            commit_index: self.raft.commit_index(),
            last_applied: self.raft.last_applied(),
            peers: self.mesh.peers().count(),
            voters: self.raft.voters().iter().cloned().collect(),
            quorum_available: self.quorum_available,
            pending: self.db.pending_count(),
            halted: self.db.is_halted(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionBuilder, TransactionPayload};
    use serde_json::json;

    fn test_config() -> NodeConfig {
        NodeConfig {
            mesh: MeshConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                ..MeshConfig::default()
            },
            block_interval: Duration::from_millis(50),
            ..NodeConfig::default()
        }
    }

    fn set(kp: &NodeKeypair, nonce: u64, key: &str, value: Value) -> Transaction {
        TransactionBuilder::new(TransactionPayload::StateSet {
            key: key.into(),
            value,
        })
        .nonce(nonce)
        .sign(kp)
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Solo".parse::<Mode>().unwrap(), Mode::Solo);
        assert_eq!("raft".parse::<Mode>().unwrap(), Mode::Raft);
        assert!("paxos".parse::<Mode>().is_err());
    }

    #[test]
    fn config_rejects_inverted_timeouts() {
        let mut config = test_config();
        config.raft.election_timeout_min = Duration::from_millis(500);
        config.raft.election_timeout_max = Duration::from_millis(400);
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn initial_voters_always_include_self() {
        let mut config = test_config();
        config.voters = vec!["b".into(), "a".into(), "b".into()];
        assert_eq!(config.initial_voters("a"), vec!["a".to_string()]);
        config.mode = Mode::Raft;
        assert_eq!(
            config.initial_voters("a"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn governance_never_shrinks_the_configured_voters() {
        let ids = |v: &[&str]| -> Vec<NodeId> { v.iter().map(|s| s.to_string()).collect() };
        let configured = ids(&["a", "b", "c"]);

        // A client key and one real node as members: nothing changes.
        assert_eq!(
            governed_voters(&configured, &configured, &ids(&["b", "c"]), &ids(&["a", "client"])),
            configured
        );
        // A connected node that becomes a member joins.
        assert_eq!(
            governed_voters(&configured, &configured, &ids(&["b", "c", "d"]), &ids(&["d"])),
            ids(&["a", "b", "c", "d"])
        );
        // An unreachable one waits until it connects.
        assert_eq!(
            governed_voters(&configured, &configured, &ids(&["b"]), &ids(&["d"])),
            configured
        );
        // Removing it from the members removes the vote, but configured
        // nodes stay.
        assert_eq!(
            governed_voters(&configured, &ids(&["a", "b", "c", "d"]), &ids(&["b", "d"]), &ids(&["a"])),
            configured
        );
    }

    #[tokio::test]
    async fn solo_node_leads_immediately() {
        let node = Node::start(test_config(), NodeKeypair::generate())
            .await
            .unwrap();
        let status = node.status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.leader_id.as_deref(), Some(node.node_id()));
        assert!(status.quorum_available);
        assert_eq!(status.height, 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn submitted_transaction_is_confirmed() {
        let node = Node::start(test_config(), NodeKeypair::generate())
            .await
            .unwrap();
        let mut events = node.subscribe();
        let client = NodeKeypair::generate();

        let tx = set(&client, 0, "asset:1", json!({"owner": "org1"}));
        let receipt = node.submit(tx.clone()).await.unwrap();
        assert_eq!(receipt.status, TransactionStatus::Pending);
        assert_eq!(node.next_nonce(&client.public_key_hex()).unwrap(), 1);

        assert!(node.wait_for_height(1, Duration::from_secs(5)).await);
        assert_eq!(
            node.transaction_status(&tx.hash).unwrap(),
            Some(TransactionStatus::Confirmed { block_height: 1 })
        );
        assert_eq!(
            node.get_state("asset:1").unwrap().unwrap().value,
            json!({"owner": "org1"})
        );

        // Block first, then its transactions.
        let mut saw_block = false;
        loop {
            match events.recv().await.unwrap() {
                NodeEvent::BlockCommitted(block) => {
                    assert_eq!(block.height(), 1);
                    saw_block = true;
                }
                NodeEvent::TxConfirmed { hash, block_height } => {
                    assert!(saw_block);
                    assert_eq!(hash, tx.hash);
                    assert_eq!(block_height, 1);
                    break;
                }
                _ => {}
            }
        }
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn replayed_nonce_is_refused() {
        let node = Node::start(test_config(), NodeKeypair::generate())
            .await
            .unwrap();
        let client = NodeKeypair::generate();
        node.submit(set(&client, 0, "k", json!(1))).await.unwrap();
        assert!(node.wait_for_height(1, Duration::from_secs(5)).await);

        let replay = set(&client, 0, "k", json!(2));
        assert!(matches!(
            node.submit(replay).await,
            Err(NodeError::NonceUsed { next: 1, .. })
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pending_nonce_conflict_and_duplicates() {
        let mut config = test_config();
        config.block_interval = Duration::from_secs(3600);
        let node = Node::start(config, NodeKeypair::generate()).await.unwrap();
        let client = NodeKeypair::generate();

        let first = set(&client, 0, "k", json!(1));
        node.submit(first.clone()).await.unwrap();
        assert!(matches!(
            node.submit(first).await,
            Err(NodeError::Duplicate(_))
        ));
        assert!(matches!(
            node.submit(set(&client, 0, "k", json!(2))).await,
            Err(NodeError::NonceConflict { nonce: 0, .. })
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unsigned_transaction_is_invalid() {
        let node = Node::start(test_config(), NodeKeypair::generate())
            .await
            .unwrap();
        let tx = TransactionBuilder::new(TransactionPayload::StateDelete { key: "k".into() })
            .sender(&NodeKeypair::generate().public_key_hex())
            .build();
        assert!(matches!(node.submit(tx).await, Err(NodeError::Invalid(_))));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn produce_block_cuts_an_empty_block() {
        let mut config = test_config();
        config.block_interval = Duration::from_secs(3600);
        let node = Node::start(config, NodeKeypair::generate()).await.unwrap();
        assert_eq!(node.produce_block().await.unwrap(), Some(1));
        assert!(node.wait_for_height(1, Duration::from_secs(5)).await);
        assert_eq!(node.get_latest_block().unwrap().tx_count(), 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handle_fails_after_shutdown() {
        let node = Node::start(test_config(), NodeKeypair::generate())
            .await
            .unwrap();
        node.shutdown().await.unwrap();
        node.shutdown().await.unwrap();
        let tx = set(&NodeKeypair::generate(), 0, "k", json!(1));
        assert!(matches!(node.submit(tx).await, Err(NodeError::Stopped)));
        // Reads still work against storage.
        assert_eq!(node.get_latest_block().unwrap().height(), 0);
    }

    #[tokio::test]
    async fn restart_keeps_chain_and_term() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = NodeKeypair::generate();
        let mut config = test_config();
        config.data_dir = Some(dir.path().to_path_buf());

        let secret = keypair.secret_hex();
        let node = Node::start(config.clone(), keypair).await.unwrap();
        node.produce_block().await.unwrap();
        assert!(node.wait_for_height(1, Duration::from_secs(5)).await);
        let term = node.status().term;
        node.shutdown().await.unwrap();
        drop(node);

        let keypair = NodeKeypair::from_hex(&secret).unwrap();
        let node = Node::start(config, keypair).await.unwrap();
        let status = node.status();
        assert_eq!(status.height, 1);
        assert!(status.term > term);
        node.shutdown().await.unwrap();
    }
}
