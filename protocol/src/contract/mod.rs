//! # Contract Runtime
//!
//! Contracts never touch storage directly. The executor hands a runtime a
//! [`ContractHost`]: a narrow, synchronous capability surface with
//! `get`/`set`/`delete`/`log` plus read-only invocation metadata. Whatever
//! the runtime does through the host becomes the transaction's state diff;
//! anything else it does is invisible to consensus.
//!
//! ## Budgets
//!
//! Every invocation runs under two limits:
//!
//! - **fuel**: a deterministic count of operations, identical on every node;
//! - **wall clock**: a hard time budget (default 5 seconds) that stops a
//!   runaway invocation on a slow machine.
//!
//! Running out of either is a [`ContractError`], and the executor treats it
//! exactly like any other rejection: the transaction's writes are discarded.
//!
//! The wall clock only applies while a block is being assembled
//! ([`Budget::Full`]). Replaying a committed block runs under fuel alone
//! ([`Budget::FuelOnly`]), so every node reaches the leader's result no
//! matter how slow it is.
//!
//! ## The built-in runtime
//!
//! [`ScriptRuntime`] interprets contracts written as JSON documents:
//!
//! ```json
//! {
//!   "methods": {
//!     "increment": [
//!       { "op": "require", "equals": ["$sender", "$owner"], "reason": "owner only" },
//!       { "op": "incr", "key": "counter", "by": "$args.by" },
//!       { "op": "log", "message": "incremented" }
//!     ]
//!   }
//! }
//! ```
//!
//! Expressions are literal JSON values, or strings starting with `$`:
//! `$sender`, `$owner`, `$contract_id`, `$block_height`, `$timestamp`,
//! `$args`, `$args.<field>`, and `$state.<key>`.
//!
//! Other runtimes (a WASM sandbox, a subprocess) plug in through the
//! [`ContractRuntime`] trait.

use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{CONTRACT_FUEL, CONTRACT_TIME_BUDGET};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("invalid contract code: {0}")]
    InvalidCode(String),

    #[error("unknown method {0:?}")]
    UnknownMethod(String),

    #[error("contract failed: {0}")]
    Failed(String),

    #[error("fuel exhausted after {0} ops")]
    OutOfFuel(u64),

    #[error("wall-clock budget of {0:?} exceeded")]
    Timeout(Duration),

    #[error("host rejected operation: {0}")]
    Host(String),
}

// ---------------------------------------------------------------------------
// Host Interface
// ---------------------------------------------------------------------------

/// Read-only facts about the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub contract_id: String,
    /// Hex public key of the account that deployed the contract.
    pub owner: String,
    /// Hex public key of the transaction sender.
    pub sender: String,
    pub block_height: u64,
    pub timestamp: u64,
    pub budget: Budget,
}

/// Which limits an invocation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Fuel and wall clock. Used for transactions not yet in a block.
    Full,
    /// Fuel only. Used for transactions of a committed block.
    FuelOnly,
}

/// The capabilities a contract gets. Keys are relative to the contract's
/// own namespace; the host decides where they actually live.
pub trait ContractHost {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<(), ContractError>;
    fn delete(&mut self, key: &str) -> Result<bool, ContractError>;
    fn log(&mut self, message: String);
    fn context(&self) -> &InvocationContext;
}

/// A contract execution engine.
pub trait ContractRuntime: Send + Sync {
    /// Reject code that could never run. Called once at deploy.
    fn validate(&self, code: &Value) -> Result<(), ContractError>;

    /// Run `method`. The return value is informational only; state changes
    /// happen through `host`.
    fn invoke(
        &self,
        code: &Value,
        method: &str,
        args: &Value,
        host: &mut dyn ContractHost,
    ) -> Result<Value, ContractError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Budgets for contract execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Maximum ops per invocation. Deterministic.
    pub fuel: u64,
    /// Wall-clock budget per invocation.
    pub time_budget: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fuel: CONTRACT_FUEL,
            time_budget: CONTRACT_TIME_BUDGET,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptRuntime
// ---------------------------------------------------------------------------

/// The built-in JSON op-list interpreter.
#[derive(Debug, Clone, Default)]
pub struct ScriptRuntime {
    config: ExecutionConfig,
}

const KNOWN_OPS: &[&str] = &["set", "delete", "incr", "log", "require", "fail", "return"];

impl ScriptRuntime {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    fn methods(code: &Value) -> Result<&serde_json::Map<String, Value>, ContractError> {
        code.get("methods")
            .and_then(Value::as_object)
            .ok_or_else(|| ContractError::InvalidCode("missing \"methods\" object".into()))
    }
}

impl ContractRuntime for ScriptRuntime {
    fn validate(&self, code: &Value) -> Result<(), ContractError> {
        for (name, body) in Self::methods(code)? {
            let ops = body.as_array().ok_or_else(|| {
                ContractError::InvalidCode(format!("method {:?} is not an op list", name))
            })?;
            for op in ops {
                let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
                if !KNOWN_OPS.contains(&kind) {
                    return Err(ContractError::InvalidCode(format!(
                        "method {:?} uses unknown op {:?}",
                        name, kind
                    )));
                }
            }
        }
        Ok(())
    }

    fn invoke(
        &self,
        code: &Value,
        method: &str,
        args: &Value,
        host: &mut dyn ContractHost,
    ) -> Result<Value, ContractError> {
        let ops = Self::methods(code)?
            .get(method)
            .and_then(Value::as_array)
            .ok_or_else(|| ContractError::UnknownMethod(method.to_string()))?;

        let started = Instant::now();
        let timed = host.context().budget == Budget::Full;
        let mut fuel_used = 0u64;

        for op in ops {
            fuel_used += 1;
            if fuel_used > self.config.fuel {
                return Err(ContractError::OutOfFuel(self.config.fuel));
            }
            if timed && started.elapsed() > self.config.time_budget {
                return Err(ContractError::Timeout(self.config.time_budget));
            }

            let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
            match kind {
                "set" => {
                    let key = eval_key(op, host, args)?;
                    let value = eval(op.get("value").unwrap_or(&Value::Null), host, args);
                    host.set(&key, value)?;
                }
                "delete" => {
                    let key = eval_key(op, host, args)?;
                    host.delete(&key)?;
                }
                "incr" => {
                    let key = eval_key(op, host, args)?;
                    let by = eval(op.get("by").unwrap_or(&Value::from(1)), host, args)
                        .as_i64()
                        .ok_or_else(|| ContractError::Failed("incr amount is not an integer".into()))?;
                    let current = host.get(&key).and_then(|v| v.as_i64()).unwrap_or(0);
                    let next = current
                        .checked_add(by)
                        .ok_or_else(|| ContractError::Failed("integer overflow".into()))?;
                    host.set(&key, Value::from(next))?;
                }
                "log" => {
                    let message = eval(op.get("message").unwrap_or(&Value::Null), host, args);
                    let text = match message {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    host.log(text);
                }
                "require" => {
                    let pair = op.get("equals").and_then(Value::as_array);
                    let holds = match pair {
                        Some(items) if items.len() == 2 => {
                            eval(&items[0], host, args) == eval(&items[1], host, args)
                        }
                        _ => false,
                    };
                    if !holds {
                        let reason = op
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or("requirement not met");
                        return Err(ContractError::Failed(reason.to_string()));
                    }
                }
                "fail" => {
                    let reason = op.get("reason").and_then(Value::as_str).unwrap_or("failed");
                    return Err(ContractError::Failed(reason.to_string()));
                }
                "return" => {
                    return Ok(eval(op.get("value").unwrap_or(&Value::Null), host, args));
                }
                other => {
                    return Err(ContractError::InvalidCode(format!("unknown op {:?}", other)));
                }
            }
        }

        Ok(Value::Null)
    }
}

fn eval_key(op: &Value, host: &dyn ContractHost, args: &Value) -> Result<String, ContractError> {
    match eval(op.get("key").unwrap_or(&Value::Null), host, args) {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ContractError::Failed("op key must be a non-empty string".into())),
    }
}

/// Resolve an expression. Unresolvable references evaluate to `null`.
fn eval(expr: &Value, host: &dyn ContractHost, args: &Value) -> Value {
    let Some(reference) = expr.as_str().and_then(|s| s.strip_prefix('$')) else {
        return expr.clone();
    };
    let ctx = host.context();
    match reference {
        "sender" => Value::from(ctx.sender.clone()),
        "owner" => Value::from(ctx.owner.clone()),
        "contract_id" => Value::from(ctx.contract_id.clone()),
        "block_height" => Value::from(ctx.block_height),
        "timestamp" => Value::from(ctx.timestamp),
        "args" => args.clone(),
        other => {
            if let Some(field) = other.strip_prefix("args.") {
                args.get(field).cloned().unwrap_or(Value::Null)
            } else if let Some(key) = other.strip_prefix("state.") {
                host.get(key).unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct MapHost {
        ctx: InvocationContext,
        state: BTreeMap<String, Value>,
        logs: Vec<String>,
    }

    impl MapHost {
        fn new(sender: &str) -> Self {
            Self {
                ctx: InvocationContext {
                    contract_id: "counter".into(),
                    owner: "owner".into(),
                    sender: sender.into(),
                    block_height: 7,
                    timestamp: 99,
                    budget: Budget::Full,
                },
                state: BTreeMap::new(),
                logs: Vec::new(),
            }
        }
    }

    impl ContractHost for MapHost {
        fn get(&self, key: &str) -> Option<Value> {
            self.state.get(key).cloned()
        }
        fn set(&mut self, key: &str, value: Value) -> Result<(), ContractError> {
            self.state.insert(key.to_string(), value);
            Ok(())
        }
        fn delete(&mut self, key: &str) -> Result<bool, ContractError> {
            Ok(self.state.remove(key).is_some())
        }
        fn log(&mut self, message: String) {
            self.logs.push(message);
        }
        fn context(&self) -> &InvocationContext {
            &self.ctx
        }
    }

    fn counter_code() -> Value {
        json!({
            "methods": {
                "increment": [
                    { "op": "incr", "key": "count", "by": "$args.by" },
                    { "op": "set", "key": "last_caller", "value": "$sender" },
                    { "op": "log", "message": "bumped" }
                ],
                "reset": [
                    { "op": "require", "equals": ["$sender", "$owner"], "reason": "owner only" },
                    { "op": "delete", "key": "count" }
                ],
                "read": [
                    { "op": "return", "value": "$state.count" }
                ]
            }
        })
    }

    #[test]
    fn validate_accepts_known_ops() {
        let rt = ScriptRuntime::default();
        assert!(rt.validate(&counter_code()).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_ops_and_missing_methods() {
        let rt = ScriptRuntime::default();
        assert!(rt.validate(&json!({"methods": {"x": [{"op": "spawn"}]}})).is_err());
        assert!(rt.validate(&json!({"nope": 1})).is_err());
    }

    #[test]
    fn increment_updates_host_state() {
        let rt = ScriptRuntime::default();
        let mut host = MapHost::new("alice");
        rt.invoke(&counter_code(), "increment", &json!({"by": 5}), &mut host)
            .unwrap();
        rt.invoke(&counter_code(), "increment", &json!({"by": 2}), &mut host)
            .unwrap();
        assert_eq!(host.state["count"], json!(7));
        assert_eq!(host.state["last_caller"], json!("alice"));
        assert_eq!(host.logs.len(), 2);

        let read = rt
            .invoke(&counter_code(), "read", &Value::Null, &mut host)
            .unwrap();
        assert_eq!(read, json!(7));
    }

    #[test]
    fn require_failure_is_an_error() {
        let rt = ScriptRuntime::default();
        let mut host = MapHost::new("mallory");
        let err = rt
            .invoke(&counter_code(), "reset", &Value::Null, &mut host)
            .unwrap_err();
        assert_eq!(err, ContractError::Failed("owner only".into()));
    }

    #[test]
    fn unknown_method_is_an_error() {
        let rt = ScriptRuntime::default();
        let mut host = MapHost::new("alice");
        assert_eq!(
            rt.invoke(&counter_code(), "missing", &Value::Null, &mut host),
            Err(ContractError::UnknownMethod("missing".into()))
        );
    }

    #[test]
    fn fuel_budget_is_enforced() {
        let rt = ScriptRuntime::new(ExecutionConfig {
            fuel: 2,
            time_budget: CONTRACT_TIME_BUDGET,
        });
        let mut host = MapHost::new("alice");
        let code = json!({"methods": {"spin": [
            {"op": "log", "message": 1},
            {"op": "log", "message": 2},
            {"op": "log", "message": 3}
        ]}});
        assert_eq!(
            rt.invoke(&code, "spin", &Value::Null, &mut host),
            Err(ContractError::OutOfFuel(2))
        );
    }

    #[test]
    fn zero_time_budget_times_out() {
        let rt = ScriptRuntime::new(ExecutionConfig {
            fuel: CONTRACT_FUEL,
            time_budget: Duration::ZERO,
        });
        let mut host = MapHost::new("alice");
        let code = json!({"methods": {"slow": [
            {"op": "log", "message": "a"},
            {"op": "log", "message": "b"}
        ]}});
        let result = rt.invoke(&code, "slow", &Value::Null, &mut host);
        // The first op may squeeze in before the clock is read; the second
        // cannot.
        assert!(matches!(result, Err(ContractError::Timeout(_))));
    }

    #[test]
    fn fuel_only_budget_ignores_the_clock() {
        let rt = ScriptRuntime::new(ExecutionConfig {
            fuel: 2,
            time_budget: Duration::ZERO,
        });
        let mut host = MapHost::new("alice");
        host.ctx.budget = Budget::FuelOnly;
        let code = json!({"methods": {
            "slow": [
                {"op": "log", "message": "a"},
                {"op": "log", "message": "b"}
            ],
            "long": [
                {"op": "log", "message": "a"},
                {"op": "log", "message": "b"},
                {"op": "log", "message": "c"}
            ]
        }});
        assert_eq!(rt.invoke(&code, "slow", &Value::Null, &mut host), Ok(Value::Null));
        assert_eq!(host.logs.len(), 2);
        // Fuel still binds.
        assert_eq!(
            rt.invoke(&code, "long", &Value::Null, &mut host),
            Err(ContractError::OutOfFuel(2))
        );
    }
}
