//! End-to-end tests over real localhost TCP.
//!
//! Each node gets its own temporary database and an ephemeral port. Raft
//! timings are shortened so elections settle in well under a second.

use std::time::Duration;

use serde_json::{json, Value};

use raftchain_protocol::consensus::{RaftConfig, Role};
use raftchain_protocol::crypto::keys::NodeKeypair;
use raftchain_protocol::network::MeshConfig;
use raftchain_protocol::transaction::{
    GovernanceAction, Transaction, TransactionBuilder, TransactionPayload, TransactionStatus,
};
use raftchain_protocol::{Mode, Node, NodeConfig, NodeHandle};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(15);

fn config(mode: Mode, voters: Vec<String>, seeds: Vec<String>) -> NodeConfig {
    NodeConfig {
        mode,
        voters,
        mesh: MeshConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            seeds,
            ping_interval: Duration::from_millis(200),
            ..MeshConfig::default()
        },
        raft: RaftConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(50),
            ..RaftConfig::default()
        },
        block_interval: Duration::from_millis(50),
        tick_interval: Duration::from_millis(10),
        ..NodeConfig::default()
    }
}

fn set(client: &NodeKeypair, nonce: u64, key: &str, value: Value) -> Transaction {
    TransactionBuilder::new(TransactionPayload::StateSet {
        key: key.into(),
        value,
    })
    .nonce(nonce)
    .sign(client)
}

async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// The single node that currently leads, if exactly one does.
fn sole_leader(nodes: &[&NodeHandle]) -> Option<usize> {
    let leaders: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.status().role == Role::Leader)
        .map(|(i, _)| i)
        .collect();
    match leaders.as_slice() {
        [one] => Some(*one),
        _ => None,
    }
}

/// Three Raft nodes meshed through the first one, all agreeing on a
/// leader. Returns the nodes and the leader's index.
async fn raft_cluster() -> (Vec<NodeHandle>, usize) {
    let keys: Vec<NodeKeypair> = (0..3).map(|_| NodeKeypair::generate()).collect();
    let ids: Vec<String> = keys.iter().map(|k| k.node_id()).collect();
    let others = |i: usize| -> Vec<String> {
        ids.iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, id)| id.clone())
            .collect()
    };

    let mut nodes = Vec::new();
    let mut seeds = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let node = Node::start(config(Mode::Raft, others(i), seeds.clone()), key)
            .await
            .unwrap();
        if seeds.is_empty() {
            seeds.push(node.p2p_addr().to_string());
        }
        nodes.push(node);
    }

    let refs: Vec<&NodeHandle> = nodes.iter().collect();
    assert!(wait_until(WAIT, || refs.iter().all(|n| n.status().peers == 2)).await);
    assert!(wait_until(WAIT, || sole_leader(&refs).is_some()).await);
    let leader = sole_leader(&refs).unwrap();
    let leader_id = ids[leader].clone();
    assert!(wait_until(WAIT, || refs
        .iter()
        .all(|n| n.status().leader_id.as_deref() == Some(leader_id.as_str())))
    .await);
    (nodes, leader)
}

async fn wait_for_status(node: &NodeHandle, hash: &str) -> TransactionStatus {
    let settled = wait_until(WAIT, || {
        matches!(node.transaction_status(hash).unwrap(), Some(s) if s.is_final())
    })
    .await;
    assert!(settled, "transaction {} never settled", hash);
    node.transaction_status(hash).unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Single node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_node_versions_a_key_across_two_blocks() {
    let node = Node::start(config(Mode::Solo, vec![], vec![]), NodeKeypair::generate())
        .await
        .unwrap();
    let client = NodeKeypair::generate();
    assert_eq!(node.get_latest_block().unwrap().height(), 0);

    node.submit(set(&client, 0, "a", json!("1"))).await.unwrap();
    assert!(node.wait_for_height(1, WAIT).await);
    let entry = node.get_state("a").unwrap().unwrap();
    assert_eq!(entry.value, json!("1"));
    assert_eq!(entry.version, 1);
    let first = node.get_block(1).unwrap().unwrap();

    node.submit(set(&client, 1, "a", json!("2"))).await.unwrap();
    assert!(node.wait_for_height(2, WAIT).await);
    let entry = node.get_state("a").unwrap().unwrap();
    assert_eq!(entry.value, json!("2"));
    assert_eq!(entry.version, 2);
    let second = node.get_block(2).unwrap().unwrap();

    assert_ne!(first.header.state_root, second.header.state_root);
    assert_eq!(second.header.previous_hash, first.hash());

    let rows = node
        .query("SELECT key, version FROM world_state WHERE key = ?", &[json!("a")])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["version"], json!(2));
    assert!(node.query("DELETE FROM world_state", &[]).is_err());

    node.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Three-node Raft
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_survive_leader_loss() {
    let (cluster, first) = raft_cluster().await;
    let nodes: Vec<&NodeHandle> = cluster.iter().collect();
    let first_term = nodes[first].status().term;

    let client = NodeKeypair::generate();
    let tx = set(&client, 0, "asset:1", json!({"owner": "org1"}));
    nodes[first].submit(tx.clone()).await.unwrap();
    for node in &nodes {
        assert!(node.wait_for_height(1, WAIT).await);
    }

    // Take the leader away.
    nodes[first].shutdown().await.unwrap();
    let survivors: Vec<&NodeHandle> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != first)
        .map(|(_, n)| *n)
        .collect();

    assert!(wait_until(WAIT, || sole_leader(&survivors).is_some()).await);
    let second = sole_leader(&survivors).unwrap();
    assert!(survivors[second].status().term > first_term);

    // Submit through the follower; it forwards to the new leader.
    let follower = survivors[1 - second];
    assert!(wait_until(WAIT, || follower.status().leader_id.as_deref()
        == Some(survivors[second].node_id()))
    .await);
    let tx = set(&client, 1, "asset:1", json!({"owner": "org2"}));
    follower.submit(tx.clone()).await.unwrap();

    for node in &survivors {
        assert!(matches!(
            wait_for_status(node, &tx.hash).await,
            TransactionStatus::Confirmed { .. }
        ));
        assert_eq!(
            node.get_state("asset:1").unwrap().unwrap().value,
            json!({"owner": "org2"})
        );
    }
    assert!(wait_until(WAIT, || survivors
        .iter()
        .all(|n| n.status().height == survivors[0].status().height))
    .await);
    let roots: Vec<_> = survivors
        .iter()
        .map(|n| n.get_latest_block().unwrap().header.state_root)
        .collect();
    assert_eq!(roots[0], roots[1]);

    for node in survivors {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_membership_proposal_keeps_the_cluster_writable() {
    let (cluster, leader) = raft_cluster().await;
    let nodes: Vec<&NodeHandle> = cluster.iter().collect();
    let voters = nodes[leader].status().voters;
    assert_eq!(voters.len(), 3);

    // The first proposal bootstraps the member list with the client and
    // the leader's key.
    let client = NodeKeypair::generate();
    let proposal = TransactionBuilder::new(TransactionPayload::GovernancePropose {
        proposal_id: "add-leader".into(),
        action: GovernanceAction::AddMember {
            public_key: nodes[leader].public_key().to_string(),
        },
    })
    .nonce(0)
    .sign(&client);
    nodes[leader].submit(proposal.clone()).await.unwrap();
    for node in &nodes {
        assert!(matches!(
            wait_for_status(node, &proposal.hash).await,
            TransactionStatus::Confirmed { .. }
        ));
        let status = node.status();
        assert_eq!(status.voters, voters);
        assert!(status.quorum_available);
    }

    let tx = set(&client, 1, "after", json!(true));
    nodes[leader].submit(tx.clone()).await.unwrap();
    for node in &nodes {
        assert!(matches!(
            wait_for_status(node, &tx.hash).await,
            TransactionStatus::Confirmed { .. }
        ));
    }

    for node in nodes {
        node.shutdown().await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_node_syncs_twenty_blocks() {
    let mut a_config = config(Mode::Solo, vec![], vec![]);
    a_config.block_interval = Duration::from_secs(3600);
    let a = Node::start(a_config, NodeKeypair::generate()).await.unwrap();
    let client = NodeKeypair::generate();

    for height in 1..=20u64 {
        let tx = set(&client, height - 1, &format!("item:{}", height), json!(height));
        a.submit(tx).await.unwrap();
        assert_eq!(a.produce_block().await.unwrap(), Some(height));
        assert!(a.wait_for_height(height, WAIT).await);
    }
    assert_eq!(a.get_latest_block().unwrap().tx_count(), 1);

    let mut b_config = config(Mode::Solo, vec![], vec![a.p2p_addr().to_string()]);
    b_config.block_interval = Duration::from_secs(3600);
    let b = Node::start(b_config, NodeKeypair::generate()).await.unwrap();

    assert!(b.wait_for_height(20, WAIT).await);
    let a_tip = a.get_latest_block().unwrap();
    let b_tip = b.get_latest_block().unwrap();
    assert_eq!(b_tip.hash(), a_tip.hash());
    assert_eq!(b_tip.header.state_root, a_tip.header.state_root);
    assert_eq!(b.get_state("item:7").unwrap().unwrap().value, json!(7));
    assert_eq!(b.next_nonce(&client.public_key_hex()).unwrap(), 20);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
