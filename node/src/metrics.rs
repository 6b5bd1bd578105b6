//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics`. Counters follow
//! the node's event stream; gauges follow its status snapshot. A `/status`
//! route on the same server returns the snapshot as JSON.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `raftchain` prefix.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use raftchain_protocol::consensus::Role;
use raftchain_protocol::{NodeEvent, NodeHandle, NodeStatus};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub blocks_committed_total: IntCounter,
    pub transactions_confirmed_total: IntCounter,
    pub transactions_rejected_total: IntCounter,
    pub chain_height: IntGauge,
    pub connected_peers: IntGauge,
    pub raft_term: IntGauge,
    /// 1 while this node leads.
    pub is_leader: IntGauge,
    pub pending_transactions: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Create and register every metric. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("raftchain".into()), None)?;
        Ok(Self {
            blocks_committed_total: counter(
                &registry,
                "blocks_committed_total",
                "Blocks applied to the local chain",
            )?,
            transactions_confirmed_total: counter(
                &registry,
                "transactions_confirmed_total",
                "Transactions confirmed in applied blocks",
            )?,
            transactions_rejected_total: counter(
                &registry,
                "transactions_rejected_total",
                "Pending transactions rejected",
            )?,
            chain_height: gauge(&registry, "chain_height", "Height of the local chain tip")?,
            connected_peers: gauge(&registry, "connected_peers", "Connected mesh peers")?,
            raft_term: gauge(&registry, "raft_term", "Current Raft term")?,
            is_leader: gauge(&registry, "is_leader", "1 if this node is the Raft leader")?,
            pending_transactions: gauge(
                &registry,
                "pending_transactions",
                "Transactions waiting in the pending pool",
            )?,
            registry,
        })
    }

    pub fn record_event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::BlockCommitted(_) => self.blocks_committed_total.inc(),
            NodeEvent::TxConfirmed { .. } => self.transactions_confirmed_total.inc(),
            NodeEvent::TxRejected { .. } => self.transactions_rejected_total.inc(),
            _ => {}
        }
    }

    pub fn observe_status(&self, status: &NodeStatus) {
        self.chain_height.set(status.height as i64);
        self.connected_peers.set(status.peers as i64);
        self.raft_term.set(status.term as i64);
        self.is_leader.set(i64::from(status.role == Role::Leader));
        self.pending_transactions.set(status.pending as i64);
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<NodeMetrics>,
    pub node: NodeHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.observe_status(&state.node.status());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.node.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_events() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.record_event(&NodeEvent::TxConfirmed {
            hash: "ab".into(),
            block_height: 1,
        });
        metrics.record_event(&NodeEvent::QuorumChanged { available: true });
        assert_eq!(metrics.transactions_confirmed_total.get(), 1);
        assert_eq!(metrics.blocks_committed_total.get(), 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("raftchain_transactions_confirmed_total 1"));
    }
}
