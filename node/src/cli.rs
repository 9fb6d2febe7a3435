//! # CLI Interface
//!
//! Defines the command-line argument structure for `arbiter-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use arbiter_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

/// ARBITER adjudicator node.
///
/// Boots a devnet of adjudicators in one process, drives them through
/// consensus rounds, and serves a status API and Prometheus metrics for the
/// first of them.
#[derive(Parser, Debug)]
#[command(
    name = "arbiter-node",
    about = "ARBITER adjudicator node",
    version,
    propagate_version = true
)]
pub struct ArbiterNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the ARBITER node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a devnet of adjudicators.
    Run(RunArgs),
    /// Generate a fresh adjudicator key into a data directory.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to a JSON `NodeConfig`. Missing fields take their defaults.
    #[arg(long, short = 'c', env = "ARBITER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of adjudicators to boot in this process.
    #[arg(long, short = 'n', env = "ARBITER_ADJUDICATORS", default_value_t = 4)]
    pub adjudicators: usize,

    /// Port for the HTTP status API.
    #[arg(long, env = "ARBITER_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ARBITER_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Hex-encoded Ed25519 secret key for adjudicator 0.
    ///
    /// The rest of the devnet always gets fresh keys.
    #[arg(long, env = "ARBITER_ADJUDICATOR_KEY")]
    pub adjudicator_key: Option<String>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "ARBITER_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory the key file is written to. Created if missing.
    #[arg(long, short = 'd', env = "ARBITER_DATA_DIR", default_value = ".arbiter")]
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        ArbiterNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = ArbiterNodeCli::parse_from(["arbiter-node", "run", "-n", "7"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.adjudicators, 7);
                assert_eq!(args.api_port, DEFAULT_API_PORT);
                assert_eq!(args.log_format, "pretty");
                assert!(args.config.is_none());
            }
            other => panic!("expected run, got {other:?}"),
        }
    }
}
