// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # ARBITER Adjudicator Node
//!
//! Entry point for the `arbiter-node` binary. Parses CLI arguments, boots a
//! devnet of adjudicators, drives them through consensus rounds, and serves
//! the HTTP API and Prometheus metrics for adjudicator 0.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start an in-process devnet
//! - `init`    — generate an adjudicator key into a data directory
//! - `version` — print build version information

mod api;
mod cli;
mod devnet;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use arbiter_protocol::consensus::StaticMembership;
use arbiter_protocol::crypto::keys::ArbiterKeypair;
use arbiter_protocol::network::MemoryNetwork;
use arbiter_protocol::{AdjudicatorNode, NodeConfig};

use cli::{ArbiterNodeCli, Commands};
use devnet::DevnetApplication;
use logging::LogFormat;
use metrics::NodeMetrics;

/// File name of the adjudicator key inside the data directory.
const KEY_FILE: &str = "adjudicator.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ArbiterNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Boots the devnet: adjudicators, round drivers, API and metrics servers.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::RUN_FILTER, LogFormat::from_str_lossy(&args.log_format));

    anyhow::ensure!(args.adjudicators > 0, "need at least one adjudicator");

    let config = load_config(args.config.as_deref())?;
    tracing::info!(
        adjudicators = args.adjudicators,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting arbiter-node"
    );

    // --- Keys and membership ---
    let mut keys = Vec::with_capacity(args.adjudicators);
    if let Some(secret) = &args.adjudicator_key {
        keys.push(ArbiterKeypair::from_hex(secret.trim()).context("invalid adjudicator key")?);
    }
    while keys.len() < args.adjudicators {
        keys.push(ArbiterKeypair::generate());
    }
    let membership = Arc::new(StaticMembership::new(keys.iter().map(|k| k.address())));

    // --- Adjudicators ---
    let network = MemoryNetwork::new();
    let nodes: Vec<Arc<AdjudicatorNode>> = keys
        .into_iter()
        .map(|key| {
            Arc::new(AdjudicatorNode::new(
                key,
                membership.clone(),
                config.clone(),
            ))
        })
        .collect();
    for node in &nodes {
        node.join(&network);
    }
    for node in &nodes {
        for peer in &nodes {
            if peer.address() != node.address() {
                node.connect_to(&network, peer.address())?;
            }
        }
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Round drivers ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut drivers = Vec::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        let app = DevnetApplication::new(
            node.address().to_owned(),
            Arc::clone(node.state()),
            (i == 0).then(|| Arc::clone(&node_metrics)),
        );
        let driver = node.driver(Arc::new(app));
        let rx = shutdown_rx.clone();
        drivers.push(tokio::spawn(async move { driver.run(rx).await }));
    }

    // --- API server ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            arbiter_protocol::config::PROTOCOL_VERSION,
        ),
        network: "devnet".to_string(),
        node: Arc::clone(&nodes[0]),
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!(address = %nodes[0].address(), "API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping adjudicators");
        }
    }

    // --- Drain ---
    let _ = shutdown_tx.send(true);
    for handle in futures::future::join_all(drivers).await {
        match handle {
            Ok(Err(arbiter_protocol::consensus::DriverError::Shutdown)) | Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("round driver stopped with error: {}", e),
            Err(e) => tracing::warn!("round driver task panicked: {}", e),
        }
    }
    for node in &nodes {
        node.shutdown().await;
    }

    tracing::info!("arbiter-node stopped");
    Ok(())
}

/// Reads a JSON [`NodeConfig`] from `path`, or the defaults when absent.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Generates an adjudicator key and writes it to the data directory.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging(logging::INIT_FILTER, LogFormat::Pretty);

    let (key_path, address) = write_key(&args.data_dir)?;
    tracing::info!(
        address = %address,
        key_path = %key_path.display(),
        "adjudicator keypair generated"
    );

    println!("Adjudicator initialized successfully.");
    println!("  Data directory : {}", args.data_dir.display());
    println!("  Key file       : {}", key_path.display());
    println!("  Address        : {}", address);
    Ok(())
}

/// Writes a fresh hex secret key to `<data_dir>/adjudicator.key`.
/// Returns the key path and the adjudicator's address.
fn write_key(data_dir: &Path) -> Result<(PathBuf, String)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let keypair = ArbiterKeypair::generate();
    let key_path = data_dir.join(KEY_FILE);
    std::fs::write(&key_path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write adjudicator key to {}", key_path.display()))?;

    // Restrict permissions on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok((key_path, keypair.address()))
}

/// Prints version information to stdout.
fn print_version() {
    println!("arbiter-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", arbiter_protocol::config::PROTOCOL_VERSION);
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// A handler that cannot be installed never fires; the other one still
/// does. On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_key_round_trips_through_from_hex() {
        let dir = tempfile::tempdir().unwrap();
        let (path, address) = write_key(&dir.path().join("data")).unwrap();

        assert!(path.ends_with(KEY_FILE));
        let secret = std::fs::read_to_string(&path).unwrap();
        let restored = ArbiterKeypair::from_hex(&secret).unwrap();
        assert_eq!(restored.address(), address);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn missing_config_path_means_defaults() {
        assert_eq!(load_config(None).unwrap(), NodeConfig::default());
    }

    #[test]
    fn partial_config_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "max_peers": 9 }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.max_peers, 9);
        assert_eq!(config.cache_capacity, NodeConfig::default().cache_capacity);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
