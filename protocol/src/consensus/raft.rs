//! # Raft State Machine
//!
//! Leader election and log replication, where every log entry carries one
//! full block. Committing an entry *is* finalizing its block.
//!
//! ## Shape
//!
//! [`RaftNode`] is a pure, synchronous state machine. It never touches a
//! socket or a clock. The caller drives it with three inputs:
//!
//! - [`tick`](RaftNode::tick): time has passed;
//! - [`handle_message`](RaftNode::handle_message): a peer said something;
//! - [`propose`](RaftNode::propose): the local node has a block.
//!
//! Each returns a list of [`RaftAction`]s (messages to send, entries to
//! apply, leadership changes) for the caller to carry out in order. That
//! keeps every transition on one thread of control and makes the whole
//! protocol testable with a simulated network and a fake clock.
//!
//! ## Safety rules worth repeating
//!
//! 1. A leader only counts replicas for entries from its **current** term.
//!    Earlier-term entries become committed only because a later
//!    current-term entry above them was.
//! 2. A follower's commit index never passes the last entry the leader's
//!    request actually covered.
//! 3. Any message with a higher term demotes the receiver to follower on
//!    the spot.
//!
//! A single-voter cluster elects itself without sending anything and then
//! goes through exactly the same commit procedure as everybody else; a
//! majority of one is still a majority.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN, HEARTBEAT_INTERVAL, MAX_ENTRIES_PER_APPEND,
};
use crate::storage::Block;

/// Node ids are the short hex identifiers derived from public keys.
pub type NodeId = String;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("raft storage error: {0}")]
    Storage(String),

    #[error("raft log corrupt: {0}")]
    Corrupt(String),
}

pub type RaftResult<T> = Result<T, RaftError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Candidate => write!(f, "candidate"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

/// One slot of the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based position in the log.
    pub index: u64,
    pub block: Block,
}

/// State that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub voter_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// On success, the last index the request covered. On failure, a hint:
    /// the highest index the follower might still agree on.
    pub match_index: u64,
    pub follower_id: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RaftMessage {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            Self::RequestVote(m) => m.term,
            Self::RequestVoteReply(m) => m.term,
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesReply(m) => m.term,
        }
    }
}

/// Something the caller must do on the state machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftAction {
    Send { to: NodeId, message: RaftMessage },
    /// Hand a committed entry to block application. Emitted strictly in
    /// index order, once per entry.
    Apply(LogEntry),
    /// The known leader changed. `None` means no leader is known.
    LeaderChanged {
        leader_id: Option<NodeId>,
        term: u64,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Cap on entries per AppendEntries.
    pub max_entries_per_append: usize,
    /// Voters to start with when none are persisted. Empty means `{self}`.
    pub initial_voters: Vec<NodeId>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: ELECTION_TIMEOUT_MIN,
            election_timeout_max: ELECTION_TIMEOUT_MAX,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_entries_per_append: MAX_ENTRIES_PER_APPEND,
            initial_voters: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage seam
// ---------------------------------------------------------------------------

/// Durable home for the log, the hard state and the voter set.
pub trait RaftStorage {
    fn hard_state(&self) -> RaftResult<HardState>;
    fn save_hard_state(&mut self, state: &HardState) -> RaftResult<()>;

    fn last_index(&self) -> u64;
    fn last_term(&self) -> u64;

    /// Term of the entry at `index`. Index 0 is the empty prefix with term 0.
    fn term_at(&self, index: u64) -> RaftResult<Option<u64>>;
    fn entry(&self, index: u64) -> RaftResult<Option<LogEntry>>;
    /// Up to `max` entries starting at `start`.
    fn entries(&self, start: u64, max: usize) -> RaftResult<Vec<LogEntry>>;

    fn append(&mut self, entries: &[LogEntry]) -> RaftResult<()>;
    /// Drop `index` and everything after it.
    fn truncate_from(&mut self, index: u64) -> RaftResult<()>;

    fn voters(&self) -> RaftResult<Option<Vec<NodeId>>>;
    fn save_voters(&mut self, voters: &[NodeId]) -> RaftResult<()>;
}

// ---------------------------------------------------------------------------
// RaftNode
// ---------------------------------------------------------------------------

pub struct RaftNode<S: RaftStorage> {
    id: NodeId,
    config: RaftConfig,
    storage: S,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    voters: BTreeSet<NodeId>,

    commit_index: u64,
    last_applied: u64,

    votes_received: BTreeSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,

    election_deadline: Instant,
    heartbeat_due: Instant,
}

impl<S: RaftStorage> RaftNode<S> {
    pub fn new(id: NodeId, config: RaftConfig, storage: S, now: Instant) -> RaftResult<Self> {
        let hard = storage.hard_state()?;
        let voters: BTreeSet<NodeId> = match storage.voters()? {
            Some(v) if !v.is_empty() => v.into_iter().collect(),
            _ if !config.initial_voters.is_empty() => {
                config.initial_voters.iter().cloned().collect()
            }
            _ => BTreeSet::from([id.clone()]),
        };

        let mut node = Self {
            id,
            role: Role::Follower,
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            leader_id: None,
            voters,
            commit_index: 0,
            last_applied: 0,
            votes_received: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: now,
            heartbeat_due: now,
            config,
            storage,
        };
        node.reset_election_timer(now);
        info!(
            node = %node.id,
            term = node.current_term,
            voters = node.voters.len(),
            last_index = node.storage.last_index(),
            "raft node initialized"
        );
        Ok(node)
    }

    // -- Accessors -----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.current_term
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn last_log_index(&self) -> u64 {
        self.storage.last_index()
    }

    pub fn voters(&self) -> &BTreeSet<NodeId> {
        &self.voters
    }

    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn last_entry(&self) -> RaftResult<Option<LogEntry>> {
        self.storage.entry(self.storage.last_index())
    }

    /// Entries appended but not yet committed, oldest first.
    pub fn uncommitted_entries(&self) -> RaftResult<Vec<LogEntry>> {
        let start = self.commit_index + 1;
        let last = self.storage.last_index();
        if start > last {
            return Ok(Vec::new());
        }
        self.storage.entries(start, (last - start + 1) as usize)
    }

    /// Whether this leader already has an uncommitted entry from its own
    /// term.
    pub fn has_inflight_proposal(&self) -> bool {
        self.storage.last_index() > self.commit_index
            && self.storage.last_term() == self.current_term
    }

    // -- Inputs --------------------------------------------------------------

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> RaftResult<Vec<RaftAction>> {
        let mut actions = Vec::new();
        match self.role {
            Role::Leader => {
                if now >= self.heartbeat_due {
                    self.broadcast_append(&mut actions)?;
                    self.heartbeat_due = now + self.config.heartbeat_interval;
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline && self.voters.contains(&self.id) {
                    self.start_election(now, &mut actions)?;
                }
            }
        }
        Ok(actions)
    }

    /// Process a message from `from`.
    pub fn handle_message(
        &mut self,
        from: &str,
        message: RaftMessage,
        now: Instant,
    ) -> RaftResult<Vec<RaftAction>> {
        let mut actions = Vec::new();

        if message.term() > self.current_term {
            debug!(
                node = %self.id,
                from,
                term = message.term(),
                "higher term seen, stepping down"
            );
            self.step_down(message.term(), now, &mut actions)?;
        }

        match message {
            RaftMessage::RequestVote(req) => self.on_request_vote(from, req, now, &mut actions)?,
            RaftMessage::RequestVoteReply(reply) => {
                self.on_vote_reply(reply, now, &mut actions)?
            }
            RaftMessage::AppendEntries(req) => {
                self.on_append_entries(from, req, now, &mut actions)?
            }
            RaftMessage::AppendEntriesReply(reply) => {
                self.on_append_reply(reply, &mut actions)?
            }
        }
        Ok(actions)
    }

    /// Start an election now instead of waiting for the timer. A sole
    /// voter wins on the spot.
    pub fn campaign(&mut self, now: Instant) -> RaftResult<Vec<RaftAction>> {
        let mut actions = Vec::new();
        if self.role != Role::Leader && self.voters.contains(&self.id) {
            self.start_election(now, &mut actions)?;
        }
        Ok(actions)
    }

    /// Append `block` as a new entry. Leader only. Returns the entry's
    /// index.
    pub fn propose(
        &mut self,
        block: Block,
        now: Instant,
    ) -> RaftResult<(u64, Vec<RaftAction>)> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }
        let entry = LogEntry {
            term: self.current_term,
            index: self.storage.last_index() + 1,
            block,
        };
        let index = entry.index;
        self.storage.append(std::slice::from_ref(&entry))?;
        self.match_index.insert(self.id.clone(), index);
        debug!(node = %self.id, index, term = self.current_term, "entry proposed");

        let mut actions = Vec::new();
        self.broadcast_append(&mut actions)?;
        self.heartbeat_due = now + self.config.heartbeat_interval;
        self.advance_commit(&mut actions)?;
        Ok((index, actions))
    }

    /// Replace the voter set.
    pub fn set_voters(
        &mut self,
        voters: Vec<NodeId>,
        now: Instant,
    ) -> RaftResult<Vec<RaftAction>> {
        let next: BTreeSet<NodeId> = voters.into_iter().collect();
        let mut actions = Vec::new();
        if next.is_empty() || next == self.voters {
            return Ok(actions);
        }
        let list: Vec<NodeId> = next.iter().cloned().collect();
        self.storage.save_voters(&list)?;
        info!(node = %self.id, voters = ?list, "voter set changed");
        self.voters = next;

        if self.role == Role::Leader {
            if !self.voters.contains(&self.id) {
                let term = self.current_term;
                self.become_follower();
                self.set_leader(None, term, &mut actions);
                self.reset_election_timer(now);
                return Ok(actions);
            }
            let last = self.storage.last_index();
            for peer in self.peers() {
                self.next_index.entry(peer.clone()).or_insert(last + 1);
                self.match_index.entry(peer).or_insert(0);
            }
            self.advance_commit(&mut actions)?;
        }
        Ok(actions)
    }

    /// Add one voter.
    pub fn add_voter(&mut self, voter: NodeId, now: Instant) -> RaftResult<Vec<RaftAction>> {
        if self.voters.contains(&voter) {
            return Ok(Vec::new());
        }
        let mut next: Vec<NodeId> = self.voters.iter().cloned().collect();
        next.push(voter);
        self.set_voters(next, now)
    }

    // -- Elections -----------------------------------------------------------

    fn reset_election_timer(&mut self, now: Instant) {
        let min = self.config.election_timeout_min;
        let max = self.config.election_timeout_max.max(min);
        let timeout = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        self.election_deadline = now + timeout;
    }

    fn peers(&self) -> Vec<NodeId> {
        self.voters
            .iter()
            .filter(|v| **v != self.id)
            .cloned()
            .collect()
    }

    fn persist_hard_state(&mut self) -> RaftResult<()> {
        let state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.storage.save_hard_state(&state)
    }

    fn set_leader(&mut self, leader: Option<NodeId>, term: u64, actions: &mut Vec<RaftAction>) {
        if self.leader_id != leader {
            self.leader_id = leader.clone();
            actions.push(RaftAction::LeaderChanged {
                leader_id: leader,
                term,
            });
        }
    }

    fn become_follower(&mut self) {
        self.role = Role::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    fn step_down(
        &mut self,
        term: u64,
        now: Instant,
        actions: &mut Vec<RaftAction>,
    ) -> RaftResult<()> {
        let was_leader = self.role == Role::Leader;
        self.current_term = term;
        self.voted_for = None;
        self.persist_hard_state()?;
        self.become_follower();
        // Whoever leads the new term isn't known yet.
        self.set_leader(None, term, actions);
        if was_leader {
            self.reset_election_timer(now);
            info!(node = %self.id, term, "stepped down");
        }
        Ok(())
    }

    fn start_election(&mut self, now: Instant, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.persist_hard_state()?;
        self.votes_received = BTreeSet::from([self.id.clone()]);
        let term = self.current_term;
        self.set_leader(None, term, actions);
        self.reset_election_timer(now);
        info!(node = %self.id, term, "starting election");

        if self.votes_received.len() >= self.quorum() {
            return self.become_leader(now, actions);
        }

        let request = RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.storage.last_index(),
            last_log_term: self.storage.last_term(),
        };
        for peer in self.peers() {
            actions.push(RaftAction::Send {
                to: peer,
                message: RaftMessage::RequestVote(request.clone()),
            });
        }
        Ok(())
    }

    fn become_leader(&mut self, now: Instant, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        self.role = Role::Leader;
        self.votes_received.clear();
        let last = self.storage.last_index();
        self.next_index = self.peers().into_iter().map(|p| (p, last + 1)).collect();
        self.match_index = self.peers().into_iter().map(|p| (p, 0)).collect();
        self.match_index.insert(self.id.clone(), last);

        let term = self.current_term;
        let id = self.id.clone();
        self.set_leader(Some(id), term, actions);
        info!(node = %self.id, term, last_index = last, "became leader");

        self.broadcast_append(actions)?;
        self.heartbeat_due = now + self.config.heartbeat_interval;
        self.advance_commit(actions)
    }

    fn on_request_vote(
        &mut self,
        from: &str,
        req: RequestVote,
        now: Instant,
        actions: &mut Vec<RaftAction>,
    ) -> RaftResult<()> {
        let log_ok = req.last_log_term > self.storage.last_term()
            || (req.last_log_term == self.storage.last_term()
                && req.last_log_index >= self.storage.last_index());
        let free = match &self.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };
        let grant = req.term == self.current_term && free && log_ok;

        if grant {
            self.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state()?;
            self.reset_election_timer(now);
        }
        debug!(
            node = %self.id,
            candidate = %req.candidate_id,
            term = req.term,
            grant,
            "vote requested"
        );
        actions.push(RaftAction::Send {
            to: from.to_string(),
            message: RaftMessage::RequestVoteReply(RequestVoteReply {
                term: self.current_term,
                vote_granted: grant,
                voter_id: self.id.clone(),
            }),
        });
        Ok(())
    }

    fn on_vote_reply(
        &mut self,
        reply: RequestVoteReply,
        now: Instant,
        actions: &mut Vec<RaftAction>,
    ) -> RaftResult<()> {
        if self.role != Role::Candidate || reply.term != self.current_term || !reply.vote_granted
        {
            return Ok(());
        }
        if !self.voters.contains(&reply.voter_id) {
            return Ok(());
        }
        self.votes_received.insert(reply.voter_id);
        let granted = self
            .votes_received
            .iter()
            .filter(|v| self.voters.contains(*v))
            .count();
        if granted >= self.quorum() {
            self.become_leader(now, actions)?;
        }
        Ok(())
    }

    // -- Replication ---------------------------------------------------------

    fn broadcast_append(&mut self, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        for peer in self.peers() {
            self.send_append(&peer, actions)?;
        }
        Ok(())
    }

    fn send_append(&mut self, peer: &str, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        let last = self.storage.last_index();
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.storage.term_at(prev_log_index)?.ok_or_else(|| {
            RaftError::Corrupt(format!("missing term for index {}", prev_log_index))
        })?;
        let entries = if next <= last {
            self.storage.entries(next, self.config.max_entries_per_append)?
        } else {
            Vec::new()
        };
        actions.push(RaftAction::Send {
            to: peer.to_string(),
            message: RaftMessage::AppendEntries(AppendEntries {
                term: self.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            }),
        });
        Ok(())
    }

    fn on_append_entries(
        &mut self,
        from: &str,
        req: AppendEntries,
        now: Instant,
        actions: &mut Vec<RaftAction>,
    ) -> RaftResult<()> {
        let reply = |term: u64, success: bool, match_index: u64, id: &NodeId| RaftAction::Send {
            to: from.to_string(),
            message: RaftMessage::AppendEntriesReply(AppendEntriesReply {
                term,
                success,
                match_index,
                follower_id: id.clone(),
            }),
        };

        if req.term < self.current_term {
            actions.push(reply(
                self.current_term,
                false,
                self.storage.last_index(),
                &self.id,
            ));
            return Ok(());
        }

        // Same term, but somebody else won: candidates fall back.
        if self.role != Role::Follower {
            self.become_follower();
        }
        self.set_leader(Some(req.leader_id.clone()), req.term, actions);
        self.reset_election_timer(now);

        let last = self.storage.last_index();
        if req.prev_log_index > last {
            actions.push(reply(self.current_term, false, last, &self.id));
            return Ok(());
        }
        let local_prev_term = self.storage.term_at(req.prev_log_index)?;
        if local_prev_term != Some(req.prev_log_term) {
            let hint = req.prev_log_index.saturating_sub(1);
            actions.push(reply(self.current_term, false, hint, &self.id));
            return Ok(());
        }

        let covered = req.prev_log_index + req.entries.len() as u64;
        let mut fresh_from = None;
        for (i, entry) in req.entries.iter().enumerate() {
            match self.storage.term_at(entry.index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        return Err(RaftError::Corrupt(format!(
                            "leader {} conflicts with committed index {}",
                            req.leader_id, entry.index
                        )));
                    }
                    warn!(
                        node = %self.id,
                        index = entry.index,
                        "conflicting entry, truncating log"
                    );
                    self.storage.truncate_from(entry.index)?;
                    fresh_from = Some(i);
                    break;
                }
                None => {
                    fresh_from = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = fresh_from {
            self.storage.append(&req.entries[i..])?;
        }

        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(covered);
            if target > self.commit_index {
                self.commit_index = target;
                self.apply_committed(actions)?;
            }
        }

        actions.push(reply(self.current_term, true, covered, &self.id));
        Ok(())
    }

    fn on_append_reply(
        &mut self,
        reply: AppendEntriesReply,
        actions: &mut Vec<RaftAction>,
    ) -> RaftResult<()> {
        if self.role != Role::Leader || reply.term != self.current_term {
            return Ok(());
        }
        let peer = reply.follower_id;
        if !self.voters.contains(&peer) || peer == self.id {
            return Ok(());
        }
        let last = self.storage.last_index();

        if reply.success {
            let matched = self.match_index.entry(peer.clone()).or_insert(0);
            *matched = (*matched).max(reply.match_index.min(last));
            let next = *matched + 1;
            self.next_index.insert(peer.clone(), next);
            self.advance_commit(actions)?;
            if next <= last {
                self.send_append(&peer, actions)?;
            }
        } else {
            let current = self.next_index.get(&peer).copied().unwrap_or(last + 1);
            let next = current
                .saturating_sub(1)
                .min(reply.match_index + 1)
                .max(1);
            self.next_index.insert(peer.clone(), next);
            debug!(node = %self.id, peer = %peer, next, "follower behind, backing off");
            self.send_append(&peer, actions)?;
        }
        Ok(())
    }

    /// Highest current-term index held by a majority becomes the commit
    /// index.
    fn advance_commit(&mut self, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let last = self.storage.last_index();
        let quorum = self.quorum();
        let mut n = last;
        while n > self.commit_index {
            let term = self.storage.term_at(n)?;
            if term != Some(self.current_term) {
                // Terms only decrease going backwards.
                break;
            }
            let replicas = self
                .voters
                .iter()
                .filter(|v| {
                    if **v == self.id {
                        true
                    } else {
                        self.match_index.get(*v).copied().unwrap_or(0) >= n
                    }
                })
                .count();
            if replicas >= quorum {
                debug!(node = %self.id, commit_index = n, "commit index advanced");
                self.commit_index = n;
                return self.apply_committed(actions);
            }
            n -= 1;
        }
        Ok(())
    }

    fn apply_committed(&mut self, actions: &mut Vec<RaftAction>) -> RaftResult<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self
                .storage
                .entry(index)?
                .ok_or_else(|| RaftError::Corrupt(format!("committed entry {} missing", index)))?;
            actions.push(RaftAction::Apply(entry));
            self.last_applied = index;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
