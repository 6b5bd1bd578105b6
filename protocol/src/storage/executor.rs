//! # Transaction Executor
//!
//! Turns a transaction into a state diff. The executor is the only code that
//! decides what a transaction *does*; storage decides when the result is
//! made durable.
//!
//! ## Rules
//!
//! 1. The nonce must equal the sender's next nonce. A mismatch rejects the
//!    transaction before anything is touched.
//! 2. Each transaction runs inside an overlay journal. If any step fails,
//!    every write the transaction made is undone and its nonce is *not*
//!    consumed.
//! 3. On success the sender's next nonce becomes `nonce + 1`.
//!
//! Everything here is a function of (committed state, transaction, block
//! height, block timestamp). No clocks, no randomness, no I/O besides reads
//! through the overlay. Contract invocations do carry a wall-clock budget,
//! but the fuel budget trips first on any sane machine and is the same
//! everywhere.
//!
//! ## Write hooks
//!
//! User-visible writes (`StateSet`, `StateDelete`, contract host writes) run
//! through a chain of [`StateWriteHook`]s. The built-in [`AclHook`] enforces
//! `acl:<key>` entries. Bookkeeping writes made by the executor itself
//! (`governance:*`, `contract:<id>`, `acl:*`) bypass the hooks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::db::StorageError;
use super::state::{StateOverlay, WriteContext};
use crate::contract::{
    Budget, ContractError, ContractHost, ContractRuntime, InvocationContext, ScriptRuntime,
};
use crate::crypto::keys::PublicKey;
use crate::transaction::{GovernanceAction, Transaction, TransactionPayload};

/// World-state key of the governance member list.
pub const MEMBERS_KEY: &str = "governance:members";

pub fn proposal_key(proposal_id: &str) -> String {
    format!("governance:proposal:{}", proposal_id)
}

pub fn parameter_key(name: &str) -> String {
    format!("governance:param:{}", name)
}

pub fn contract_key(contract_id: &str) -> String {
    format!("contract:{}", contract_id)
}

pub fn acl_key(key: &str) -> String {
    format!("acl:{}", key)
}

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: u64, actual: u64 },

    #[error("key {0:?} not found")]
    KeyNotFound(String),

    #[error("{sender} may not write {key:?}")]
    AccessDenied { key: String, sender: String },

    #[error("contract {0:?} already exists")]
    ContractExists(String),

    #[error("contract {0:?} not found")]
    ContractNotFound(String),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("proposal {0:?} already exists")]
    ProposalExists(String),

    #[error("proposal {0:?} not found")]
    ProposalNotFound(String),

    #[error("proposal {0:?} is closed")]
    ProposalClosed(String),

    #[error("{0} is not a governance member")]
    NotAMember(String),

    #[error("invalid governance action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ExecutionError {
    /// Storage failures halt the node; everything else just rejects the
    /// transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

// ---------------------------------------------------------------------------
// Write hooks
// ---------------------------------------------------------------------------

/// Pre/post hook around user-visible state writes. `value` is `None` for a
/// deletion.
pub trait StateWriteHook: Send + Sync {
    fn before_write(
        &self,
        state: &StateOverlay<'_>,
        ctx: &WriteContext,
        key: &str,
        value: Option<&Value>,
    ) -> ExecutionResult<()>;

    fn after_write(
        &self,
        _state: &StateOverlay<'_>,
        _ctx: &WriteContext,
        _key: &str,
        _value: Option<&Value>,
    ) {
    }
}

/// Contents of an `acl:<key>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub owner: String,
    #[serde(default)]
    pub writers: Vec<String>,
}

impl AclEntry {
    pub fn permits(&self, sender: &str) -> bool {
        self.owner == sender || self.writers.iter().any(|w| w == sender)
    }
}

/// Enforces `acl:<key>` entries.
#[derive(Debug, Default)]
pub struct AclHook;

impl StateWriteHook for AclHook {
    fn before_write(
        &self,
        state: &StateOverlay<'_>,
        ctx: &WriteContext,
        key: &str,
        _value: Option<&Value>,
    ) -> ExecutionResult<()> {
        let Some(raw) = state.get_value(&acl_key(key))? else {
            return Ok(());
        };
        let acl: AclEntry = serde_json::from_value(raw)
            .map_err(|e| StorageError::Corruption(format!("acl for {:?}: {}", key, e)))?;
        if acl.permits(&ctx.sender) {
            Ok(())
        } else {
            Err(ExecutionError::AccessDenied {
                key: key.to_string(),
                sender: ctx.sender.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Governance records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    Approved,
    Rejected,
}

/// Contents of a `governance:proposal:<id>` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub action: GovernanceAction,
    pub proposer: String,
    /// Voter public key → approve?
    pub votes: BTreeMap<String, bool>,
    pub status: ProposalStatus,
    /// Height of the block that opened the proposal.
    pub created_at: u64,
}

/// Votes needed to approve with `members` members.
pub fn approval_threshold(members: usize) -> usize {
    members / 2 + 1
}

/// Read the governance member list. Empty when no list exists yet.
pub fn read_members(state: &StateOverlay<'_>) -> ExecutionResult<Vec<String>> {
    match state.get_value(MEMBERS_KEY)? {
        Some(raw) => serde_json::from_value(raw).map_err(|e| {
            ExecutionError::Storage(StorageError::Corruption(format!("{}: {}", MEMBERS_KEY, e)))
        }),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Applies transactions to a [`StateOverlay`].
#[derive(Clone)]
pub struct Executor {
    hooks: Vec<Arc<dyn StateWriteHook>>,
    runtime: Arc<dyn ContractRuntime>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Arc::new(ScriptRuntime::default()))
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// An executor with the ACL hook installed.
    pub fn new(runtime: Arc<dyn ContractRuntime>) -> Self {
        Self {
            hooks: vec![Arc::new(AclHook)],
            runtime,
        }
    }

    /// Append a write hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn StateWriteHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Execute `tx` in block `height` with block timestamp `timestamp`.
    ///
    /// On error the overlay is exactly as it was before the call.
    pub fn execute(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Transaction,
        height: u64,
        timestamp: u64,
    ) -> ExecutionResult<()> {
        self.run(overlay, tx, height, timestamp, Budget::Full)
    }

    /// Like [`execute`](Self::execute), for a transaction of a committed
    /// block. Contracts run without the wall-clock budget.
    pub fn replay(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Transaction,
        height: u64,
        timestamp: u64,
    ) -> ExecutionResult<()> {
        self.run(overlay, tx, height, timestamp, Budget::FuelOnly)
    }

    fn run(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Transaction,
        height: u64,
        timestamp: u64,
        budget: Budget,
    ) -> ExecutionResult<()> {
        let expected = overlay.next_nonce(&tx.sender)?;
        if tx.nonce != expected {
            return Err(ExecutionError::NonceMismatch {
                expected,
                actual: tx.nonce,
            });
        }

        let ctx = WriteContext {
            sender: tx.sender.clone(),
            block_height: height,
            timestamp,
        };

        overlay.begin();
        match self.apply_payload(overlay, &tx.payload, &ctx, budget) {
            Ok(()) => {
                overlay.set_next_nonce(&tx.sender, tx.nonce + 1);
                overlay.commit();
                Ok(())
            }
            Err(e) => {
                overlay.rollback();
                Err(e)
            }
        }
    }

    fn apply_payload(
        &self,
        overlay: &mut StateOverlay<'_>,
        payload: &TransactionPayload,
        ctx: &WriteContext,
        budget: Budget,
    ) -> ExecutionResult<()> {
        match payload {
            TransactionPayload::StateSet { key, value } => {
                self.guarded_write(overlay, ctx, key, Some(value.clone()))
            }
            TransactionPayload::StateDelete { key } => {
                if overlay.get(key)?.is_none() {
                    return Err(ExecutionError::KeyNotFound(key.clone()));
                }
                self.guarded_write(overlay, ctx, key, None)
            }
            TransactionPayload::AclSet { key, writers } => {
                self.apply_acl_set(overlay, ctx, key, writers)
            }
            TransactionPayload::ContractDeploy { contract_id, code } => {
                self.apply_deploy(overlay, ctx, contract_id, code)
            }
            TransactionPayload::ContractInvoke {
                contract_id,
                method,
                args,
            } => self.apply_invoke(overlay, ctx, contract_id, method, args, budget),
            TransactionPayload::GovernancePropose {
                proposal_id,
                action,
            } => self.apply_propose(overlay, ctx, proposal_id, action),
            TransactionPayload::GovernanceVote {
                proposal_id,
                approve,
            } => self.apply_vote(overlay, ctx, proposal_id, *approve),
        }
    }

    /// A write that passes through the hook chain.
    fn guarded_write(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        key: &str,
        value: Option<Value>,
    ) -> ExecutionResult<()> {
        for hook in &self.hooks {
            hook.before_write(overlay, ctx, key, value.as_ref())?;
        }
        match &value {
            Some(v) => {
                overlay.put(key, v.clone(), ctx)?;
            }
            None => {
                overlay.delete(key)?;
            }
        }
        for hook in &self.hooks {
            hook.after_write(overlay, ctx, key, value.as_ref());
        }
        Ok(())
    }

    // -- ACL -----------------------------------------------------------------

    fn apply_acl_set(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        key: &str,
        writers: &[String],
    ) -> ExecutionResult<()> {
        let denied = || ExecutionError::AccessDenied {
            key: acl_key(key),
            sender: ctx.sender.clone(),
        };

        match overlay.get_value(&acl_key(key))? {
            Some(raw) => {
                let existing: AclEntry = serde_json::from_value(raw).map_err(|e| {
                    StorageError::Corruption(format!("acl for {:?}: {}", key, e))
                })?;
                if existing.owner != ctx.sender {
                    return Err(denied());
                }
            }
            // Claiming an unprotected key requires that nobody else wrote it
            // last.
            None => {
                if let Some(entry) = overlay.get(key)? {
                    if entry.updated_by != ctx.sender {
                        return Err(denied());
                    }
                }
            }
        }

        let mut writers = writers.to_vec();
        writers.sort();
        writers.dedup();
        let acl = AclEntry {
            owner: ctx.sender.clone(),
            writers,
        };
        overlay.put(&acl_key(key), json!(acl), ctx)?;
        Ok(())
    }

    // -- Contracts -----------------------------------------------------------

    fn apply_deploy(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        contract_id: &str,
        code: &Value,
    ) -> ExecutionResult<()> {
        let key = contract_key(contract_id);
        if overlay.get(&key)?.is_some() {
            return Err(ExecutionError::ContractExists(contract_id.to_string()));
        }
        self.runtime.validate(code)?;
        overlay.put(&key, json!({ "owner": ctx.sender, "code": code }), ctx)?;
        debug!(contract_id, owner = %ctx.sender, "contract deployed");
        Ok(())
    }

    fn apply_invoke(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        contract_id: &str,
        method: &str,
        args: &Value,
        budget: Budget,
    ) -> ExecutionResult<()> {
        let record = overlay
            .get_value(&contract_key(contract_id))?
            .ok_or_else(|| ExecutionError::ContractNotFound(contract_id.to_string()))?;
        let owner = record
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let code = record.get("code").cloned().unwrap_or(Value::Null);

        let mut host = OverlayHost {
            executor: self,
            overlay,
            write_ctx: ctx.clone(),
            prefix: format!("{}:", contract_key(contract_id)),
            invocation: InvocationContext {
                contract_id: contract_id.to_string(),
                owner,
                sender: ctx.sender.clone(),
                block_height: ctx.block_height,
                timestamp: ctx.timestamp,
                budget,
            },
            fatal: None,
            denied: None,
        };

        let outcome = self.runtime.invoke(&code, method, args, &mut host);

        if let Some(fatal) = host.fatal.take() {
            return Err(ExecutionError::Storage(fatal));
        }
        if let Some(denied) = host.denied.take() {
            return Err(denied);
        }
        let result = outcome?;
        debug!(contract_id, method, result = %result, "contract invoked");
        Ok(())
    }

    // -- Governance ----------------------------------------------------------

    fn apply_propose(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        proposal_id: &str,
        action: &GovernanceAction,
    ) -> ExecutionResult<()> {
        let key = proposal_key(proposal_id);
        if overlay.get(&key)?.is_some() {
            return Err(ExecutionError::ProposalExists(proposal_id.to_string()));
        }

        let members = read_members(overlay)?;
        if !members.is_empty() && !members.contains(&ctx.sender) {
            return Err(ExecutionError::NotAMember(ctx.sender.clone()));
        }

        match action {
            GovernanceAction::AddMember { public_key } => {
                PublicKey::from_hex(public_key).map_err(|_| {
                    ExecutionError::InvalidAction(format!("bad public key {}", public_key))
                })?;
                if members.contains(public_key) {
                    return Err(ExecutionError::InvalidAction(format!(
                        "{} is already a member",
                        public_key
                    )));
                }
            }
            GovernanceAction::RemoveMember { public_key } => {
                if !members.contains(public_key) {
                    return Err(ExecutionError::InvalidAction(format!(
                        "{} is not a member",
                        public_key
                    )));
                }
            }
            GovernanceAction::SetParameter { name, .. } => {
                if name.is_empty() {
                    return Err(ExecutionError::InvalidAction("empty parameter name".into()));
                }
            }
        }

        let mut proposal = Proposal {
            action: action.clone(),
            proposer: ctx.sender.clone(),
            votes: BTreeMap::from([(ctx.sender.clone(), true)]),
            status: ProposalStatus::Open,
            created_at: ctx.block_height,
        };
        self.tally(overlay, ctx, &members, &mut proposal)?;
        overlay.put(&key, json!(proposal), ctx)?;
        Ok(())
    }

    fn apply_vote(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        proposal_id: &str,
        approve: bool,
    ) -> ExecutionResult<()> {
        let key = proposal_key(proposal_id);
        let raw = overlay
            .get_value(&key)?
            .ok_or_else(|| ExecutionError::ProposalNotFound(proposal_id.to_string()))?;
        let mut proposal: Proposal = serde_json::from_value(raw)
            .map_err(|e| StorageError::Corruption(format!("{}: {}", key, e)))?;
        if proposal.status != ProposalStatus::Open {
            return Err(ExecutionError::ProposalClosed(proposal_id.to_string()));
        }

        let members = read_members(overlay)?;
        if !members.contains(&ctx.sender) {
            return Err(ExecutionError::NotAMember(ctx.sender.clone()));
        }

        proposal.votes.insert(ctx.sender.clone(), approve);
        self.tally(overlay, ctx, &members, &mut proposal)?;
        overlay.put(&key, json!(proposal), ctx)?;
        Ok(())
    }

    /// Close the proposal if the votes decide it, enacting it on approval.
    fn tally(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        members: &[String],
        proposal: &mut Proposal,
    ) -> ExecutionResult<()> {
        // No members yet: the proposer alone decides.
        if members.is_empty() {
            proposal.status = ProposalStatus::Approved;
            return self.enact(overlay, ctx, members, proposal);
        }

        let threshold = approval_threshold(members.len());
        let (mut approvals, mut rejections) = (0usize, 0usize);
        for (voter, approve) in &proposal.votes {
            if !members.contains(voter) {
                continue;
            }
            if *approve {
                approvals += 1;
            } else {
                rejections += 1;
            }
        }
        if approvals >= threshold {
            proposal.status = ProposalStatus::Approved;
            self.enact(overlay, ctx, members, proposal)?;
        } else if rejections > members.len() - threshold {
            proposal.status = ProposalStatus::Rejected;
        }
        Ok(())
    }

    fn enact(
        &self,
        overlay: &mut StateOverlay<'_>,
        ctx: &WriteContext,
        members: &[String],
        proposal: &Proposal,
    ) -> ExecutionResult<()> {
        match &proposal.action {
            GovernanceAction::AddMember { public_key } => {
                let mut next = members.to_vec();
                // Bootstrapping the list makes the proposer a founding member.
                if next.is_empty() {
                    next.push(proposal.proposer.clone());
                }
                next.push(public_key.clone());
                next.sort();
                next.dedup();
                overlay.put(MEMBERS_KEY, json!(next), ctx)?;
            }
            GovernanceAction::RemoveMember { public_key } => {
                let next: Vec<String> =
                    members.iter().filter(|m| *m != public_key).cloned().collect();
                overlay.put(MEMBERS_KEY, json!(next), ctx)?;
            }
            GovernanceAction::SetParameter { name, value } => {
                overlay.put(&parameter_key(name), value.clone(), ctx)?;
            }
        }
        debug!(action = ?proposal.action, "governance proposal enacted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Contract host
// ---------------------------------------------------------------------------

/// Host surface handed to a contract. Keys are confined to
/// `contract:<id>:`.
struct OverlayHost<'e, 'o, 'b> {
    executor: &'e Executor,
    overlay: &'o mut StateOverlay<'b>,
    write_ctx: WriteContext,
    prefix: String,
    invocation: InvocationContext,
    /// A storage failure seen through the host. Outranks whatever the
    /// runtime returns.
    fatal: Option<StorageError>,
    /// A hook refusal seen through the host.
    denied: Option<ExecutionError>,
}

impl OverlayHost<'_, '_, '_> {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn write(&mut self, key: &str, value: Option<Value>) -> Result<(), ContractError> {
        let full = self.full_key(key);
        match self
            .executor
            .guarded_write(self.overlay, &self.write_ctx, &full, value)
        {
            Ok(()) => Ok(()),
            Err(ExecutionError::Storage(e)) => {
                let msg = e.to_string();
                self.fatal = Some(e);
                Err(ContractError::Host(msg))
            }
            Err(other) => {
                let msg = other.to_string();
                self.denied = Some(other);
                Err(ContractError::Host(msg))
            }
        }
    }
}

impl ContractHost for OverlayHost<'_, '_, '_> {
    fn get(&self, key: &str) -> Option<Value> {
        // A read failure here resurfaces on the next write or when the
        // overlay is committed; reads alone can't diverge state.
        self.overlay.get_value(&self.full_key(key)).ok().flatten()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), ContractError> {
        self.write(key, Some(value))
    }

    fn delete(&mut self, key: &str) -> Result<bool, ContractError> {
        let existed = match self.overlay.get(&self.full_key(key)) {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                let msg = e.to_string();
                self.fatal = Some(e);
                return Err(ContractError::Host(msg));
            }
        };
        if existed {
            self.write(key, None)?;
        }
        Ok(existed)
    }

    fn log(&mut self, message: String) {
        debug!(contract_id = %self.invocation.contract_id, %message, "contract log");
    }

    fn context(&self) -> &InvocationContext {
        &self.invocation
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
