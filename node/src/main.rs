// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # RaftChain Node
//!
//! Entry point for the `raftchain-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the embedded node and serves
//! `/metrics` and `/status` until SIGINT or SIGTERM.
//!
//! - `run`     — start the node
//! - `init`    — create the data directory and node key
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use raftchain_protocol::crypto::keys::NodeKeypair;
use raftchain_protocol::network::MeshConfig;
use raftchain_protocol::{Mode, Node, NodeConfig};

use cli::{Commands, RaftchainCli};
use logging::LogFormat;
use metrics::{AppState, NodeMetrics};

const KEY_FILE: &str = "node.key";
const DB_DIR: &str = "db";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RaftchainCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn load_keypair(args: &cli::RunArgs) -> Result<NodeKeypair> {
    match &args.node_key {
        Some(secret) => NodeKeypair::from_hex(secret).context("invalid --node-key"),
        None => {
            let path = args.data_dir.join(KEY_FILE);
            NodeKeypair::load_or_generate(&path)
                .with_context(|| format!("failed to load node key from {}", path.display()))
        }
    }
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, LogFormat::from_str_lossy(&args.log_format));

    let mode: Mode = args.mode.parse().context("invalid --mode")?;
    let keypair = load_keypair(&args)?;
    let db_path = args.data_dir.join(DB_DIR);
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory {}", db_path.display()))?;

    let config = NodeConfig {
        data_dir: Some(db_path),
        mode,
        voters: args.voters.clone(),
        mesh: MeshConfig {
            listen_addr: args.listen,
            advertise_addr: args.advertise.clone(),
            seeds: args.seeds.clone(),
            organization: args.organization.clone(),
            ..MeshConfig::default()
        },
        block_interval: Duration::from_millis(args.block_interval_ms.max(1)),
        ..NodeConfig::default()
    };

    tracing::info!(
        node_id = %keypair.node_id(),
        %mode,
        listen = %args.listen,
        seeds = args.seeds.len(),
        voters = args.voters.len(),
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting raftchain-node"
    );

    let node = Node::start(config, keypair)
        .await
        .context("failed to start node")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let mut events = node.subscribe();
    let metrics_ref = Arc::clone(&node_metrics);
    let event_loop = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics_ref.record_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "metrics fell behind the event stream")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let router = metrics::router(AppState {
        metrics: Arc::clone(&node_metrics),
        node: node.clone(),
    });
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    node.shutdown().await.context("shutdown failed")?;
    event_loop.abort();
    tracing::info!("raftchain-node stopped");
    Ok(())
}

/// Create the data directory and key, and print what other nodes need to
/// list this one as a voter.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("raftchain_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir.join(DB_DIR))
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    let keypair = NodeKeypair::load_or_generate(&key_path)
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(key_path = %key_path.display(), "node key ready");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Node id        : {}", keypair.node_id());
    println!("  Public key     : {}", keypair.public_key_hex());

    Ok(())
}

fn print_version() {
    println!("raftchain-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol       {}", raftchain_protocol::config::PROTOCOL_VERSION);
    println!(
        "wire version   {}",
        raftchain_protocol::config::WIRE_PROTOCOL_VERSION
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
