//! # Adjudicator Node
//!
//! `AdjudicatorNode` wires one adjudicator identity to everything it needs to
//! take part in rounds: consensus state, the two round caches, the peer
//! table with its heartbeat loops, gossip exchangers, the coordinator and the
//! RPC server. The node binary and the integration tests build nodes through
//! here and nowhere else.
//!
//! ```text
//! new() -> join(network) -> connect_to(peer)* -> run_round()* -> shutdown()
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{self, ROUND_CACHE_CAPACITY};
use crate::consensus::admission::Admission;
use crate::consensus::cache::RoundCache;
use crate::consensus::coordinator::{RoundConfig, RoundCoordinator};
use crate::consensus::driver::{DriverConfig, RoundApplication, RoundDriver};
use crate::consensus::gossip::{GossipConfig, GossipExchanger};
use crate::consensus::membership::MembershipAuthority;
use crate::consensus::pruner::CachePruner;
use crate::consensus::reporter::{LogReporter, PeerReporter};
use crate::consensus::round::{EntryKind, RoundKind, RoundOutcome};
use crate::consensus::server::RoundServer;
use crate::consensus::state::{ConsensusState, RoundStatus};
use crate::consensus::tracker::{HeartbeatConfig, NodeStateTracker, PeerSummary, PeerTable};
use crate::crypto::keys::ArbiterKeypair;
use crate::crypto::signatures::{contribution_message, Ed25519Verifier, SignatureVerifier};
use crate::network::memory::MemoryNetwork;
use crate::network::rpc::{PeerClient, RoundService};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything tunable about a node, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub round: RoundConfig,
    pub gossip: GossipConfig,
    pub heartbeat: HeartbeatConfig,
    pub driver: DriverConfig,
    /// Round keys held per cache.
    pub cache_capacity: usize,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            round: RoundConfig::default(),
            gossip: GossipConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            driver: DriverConfig::default(),
            cache_capacity: ROUND_CACHE_CAPACITY,
            max_peers: config::MAX_PEERS,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Point-in-time view of a node, served by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: String,
    pub height: u64,
    pub phase: u32,
    pub status: RoundStatus,
    /// Whether the current round made it past collection.
    pub ready: bool,
    pub members: usize,
    pub connected_peers: usize,
    pub fresh_peers: usize,
    pub contribution_keys: usize,
    pub hash_keys: usize,
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("peer limit of {max} reached")]
    PeerLimit { max: usize },
    #[error("refusing to connect to self")]
    SelfConnect,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct AdjudicatorNode {
    keypair: ArbiterKeypair,
    address: String,
    state: Arc<ConsensusState>,
    membership: Arc<dyn MembershipAuthority>,
    contributions: Arc<RoundCache>,
    hashes: Arc<RoundCache>,
    table: Arc<PeerTable>,
    tracker: Arc<NodeStateTracker>,
    coordinator: Arc<RoundCoordinator>,
    server: Arc<RoundServer>,
    config: NodeConfig,
}

impl AdjudicatorNode {
    /// A node starting at height 0, verifying with Ed25519 and logging
    /// misbehaviour.
    pub fn new(
        keypair: ArbiterKeypair,
        membership: Arc<dyn MembershipAuthority>,
        config: NodeConfig,
    ) -> Self {
        Self::with_parts(
            keypair,
            membership,
            Arc::new(ConsensusState::default()),
            Arc::new(Ed25519Verifier),
            Arc::new(LogReporter),
            config,
        )
    }

    /// Builds a node around caller-supplied state, verifier and reporter.
    pub fn with_parts(
        keypair: ArbiterKeypair,
        membership: Arc<dyn MembershipAuthority>,
        state: Arc<ConsensusState>,
        verifier: Arc<dyn SignatureVerifier>,
        reporter: Arc<dyn PeerReporter>,
        config: NodeConfig,
    ) -> Self {
        let address = keypair.address();
        let contributions = Arc::new(RoundCache::with_capacity(
            EntryKind::Contribution,
            config.cache_capacity,
        ));
        let hashes = Arc::new(RoundCache::with_capacity(
            EntryKind::Hash,
            config.cache_capacity,
        ));
        let table = Arc::new(PeerTable::new());
        let pruner = Arc::new(CachePruner::new(
            Arc::clone(&contributions),
            Arc::clone(&hashes),
            Arc::clone(&state),
        ));

        let tracker = Arc::new(NodeStateTracker::new(
            keypair.clone(),
            Arc::clone(&state),
            Arc::clone(&table),
            Arc::clone(&pruner),
            Arc::clone(&verifier),
            Arc::clone(&reporter),
            config.heartbeat.clone(),
        ));
        let admission = Admission::new(
            Arc::clone(&state),
            Arc::clone(&membership),
            verifier,
            reporter,
        );

        let exchanger = |cache: &Arc<RoundCache>| {
            Arc::new(GossipExchanger::new(
                address.clone(),
                Arc::clone(cache),
                Arc::clone(&table),
                admission.clone(),
                config.gossip.clone(),
            ))
        };
        let coordinator = Arc::new(RoundCoordinator::new(
            keypair.clone(),
            Arc::clone(&state),
            Arc::clone(&membership),
            Arc::clone(&table),
            pruner,
            exchanger(&contributions),
            exchanger(&hashes),
            config.round.clone(),
        ));
        let server = Arc::new(RoundServer::new(
            Arc::clone(&state),
            Arc::clone(&contributions),
            Arc::clone(&hashes),
            Arc::clone(&tracker),
            admission,
        ));

        info!(address = %address, height = state.height(), "adjudicator node created");

        Self {
            keypair,
            address,
            state,
            membership,
            contributions,
            hashes,
            table,
            tracker,
            coordinator,
            server,
            config,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn keypair(&self) -> &ArbiterKeypair {
        &self.keypair
    }

    pub fn state(&self) -> &Arc<ConsensusState> {
        &self.state
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    pub fn tracker(&self) -> &Arc<NodeStateTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Arc<RoundCoordinator> {
        &self.coordinator
    }

    pub fn contributions(&self) -> &Arc<RoundCache> {
        &self.contributions
    }

    pub fn hashes(&self) -> &Arc<RoundCache> {
        &self.hashes
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The server half, as the transport sees it.
    pub fn service(&self) -> Arc<dyn RoundService> {
        self.server.clone()
    }

    /// Signs `payload` the way a contribution must be signed.
    pub fn sign_contribution(&self, payload: &str) -> String {
        self.keypair.sign_hex(&contribution_message(payload))
    }

    /// Signs `payload` and runs one round with it.
    pub async fn run_round(
        &self,
        phase: u32,
        payload: impl Into<String>,
        finalize_timeout: Duration,
        kind: RoundKind,
    ) -> RoundOutcome {
        let payload = payload.into();
        let signature = self.sign_contribution(&payload);
        self.coordinator
            .run_round(phase, payload, signature, finalize_timeout, kind)
            .await
    }

    /// A driver that runs `app`'s rounds on this node.
    pub fn driver(&self, app: Arc<dyn RoundApplication>) -> RoundDriver {
        RoundDriver::new(
            Arc::clone(&self.coordinator),
            self.keypair.clone(),
            Arc::clone(&self.state),
            app,
            self.config.driver.clone(),
        )
    }

    /// Adds a peer and starts heartbeating it. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self, client: Arc<dyn PeerClient>) -> Result<(), NodeError> {
        let remote = client.remote_address();
        if remote == self.address {
            return Err(NodeError::SelfConnect);
        }
        if self.table.get(remote).is_none() && self.table.len() >= self.config.max_peers {
            warn!(peer = remote, max = self.config.max_peers, "peer limit reached, rejecting connection");
            return Err(NodeError::PeerLimit {
                max: self.config.max_peers,
            });
        }
        self.tracker.connect(client);
        Ok(())
    }

    pub fn disconnect(&self, address: &str) -> bool {
        self.tracker.disconnect(address)
    }

    /// Makes this node reachable on `network`.
    pub fn join(&self, network: &Arc<MemoryNetwork>) {
        network.register(self.address.clone(), &self.service());
    }

    /// Connects to `remote` over `network`.
    pub fn connect_to(&self, network: &Arc<MemoryNetwork>, remote: &str) -> Result<(), NodeError> {
        self.connect(network.client(&self.address, remote))
    }

    pub fn status(&self) -> NodeStatus {
        let snapshot = self.state.snapshot();
        let window = self.config.heartbeat.freshness_window();
        NodeStatus {
            address: self.address.clone(),
            height: snapshot.height,
            phase: snapshot.phase,
            status: snapshot.status,
            ready: self.coordinator.is_ready(),
            members: self.membership.signing_addresses().len(),
            connected_peers: self.table.len(),
            fresh_peers: self.table.fresh(Instant::now(), window).len(),
            contribution_keys: self.contributions.key_count(),
            hash_keys: self.hashes.key_count(),
            peers: self.table.summaries(),
        }
    }

    /// Stops fills and heartbeat loops.
    pub async fn shutdown(&self) {
        info!(address = %self.address, "adjudicator node shutting down");
        self.coordinator.shutdown();
        self.tracker.shutdown().await;
    }
}
