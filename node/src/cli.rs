//! # CLI Interface
//!
//! Command-line arguments for `raftchain-node`, built with `clap` derive.
//! Every `run` flag has a `RAFTCHAIN_*` environment fallback so the binary
//! can be configured entirely from a container environment.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// RaftChain private blockchain node.
#[derive(Parser, Debug)]
#[command(
    name = "raftchain-node",
    about = "RaftChain private blockchain node",
    version,
    propagate_version = true
)]
pub struct RaftchainCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and the node key, then print the node id.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the database and the node key.
    #[arg(long, short = 'd', env = "RAFTCHAIN_DATA_DIR", default_value = "./raftchain-data")]
    pub data_dir: PathBuf,

    /// `solo` for a single-voter chain, `raft` to replicate across voters.
    #[arg(long, env = "RAFTCHAIN_MODE", default_value = "solo")]
    pub mode: String,

    /// Node ids of the other Raft voters, comma separated.
    #[arg(long, env = "RAFTCHAIN_VOTERS", value_delimiter = ',')]
    pub voters: Vec<String>,

    /// Address for peer connections.
    #[arg(long, env = "RAFTCHAIN_LISTEN", default_value = "0.0.0.0:7400")]
    pub listen: SocketAddr,

    /// Address other nodes should dial. Defaults to the listen address.
    #[arg(long, env = "RAFTCHAIN_ADVERTISE")]
    pub advertise: Option<String>,

    /// Peers to dial at startup, comma separated `host:port`.
    #[arg(long, env = "RAFTCHAIN_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Organization name presented in handshakes.
    #[arg(long, env = "RAFTCHAIN_ORG", default_value = "default")]
    pub organization: String,

    /// Port for the `/metrics` and `/status` endpoints.
    #[arg(long, env = "RAFTCHAIN_METRICS_PORT", default_value_t = 7401)]
    pub metrics_port: u16,

    /// Leader block interval in milliseconds.
    #[arg(long, env = "RAFTCHAIN_BLOCK_INTERVAL_MS", default_value_t = 1000)]
    pub block_interval_ms: u64,

    /// Hex-encoded Ed25519 secret key. When omitted the key is read from
    /// (or generated into) `<data-dir>/node.key`.
    #[arg(long, env = "RAFTCHAIN_NODE_KEY", hide_env_values = true)]
    pub node_key: Option<String>,

    /// Default log filter. `RUST_LOG` overrides it.
    #[arg(long, env = "RAFTCHAIN_LOG", default_value = "raftchain_node=info,raftchain_protocol=info")]
    pub log_level: String,

    /// `pretty` or `json`.
    #[arg(long, env = "RAFTCHAIN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "RAFTCHAIN_DATA_DIR", default_value = "./raftchain-data")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        RaftchainCli::command().debug_assert();
    }

    #[test]
    fn comma_separated_lists() {
        let cli = RaftchainCli::parse_from([
            "raftchain-node",
            "run",
            "--mode",
            "raft",
            "--voters",
            "aa,bb",
            "--seeds",
            "10.0.0.2:7400,10.0.0.3:7400",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.voters, vec!["aa", "bb"]);
        assert_eq!(args.seeds.len(), 2);
        assert_eq!(args.listen.port(), 7400);
    }
}
