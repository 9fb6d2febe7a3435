//! # Node State Tracker
//!
//! Knows where every connected adjudicator stands: last finalized height,
//! current phase, whether that phase finalized, and when we last heard.
//! The round coordinator reads this table to size its wait-set and to pick
//! gossip targets; nothing else writes it.
//!
//! ## How it works
//!
//! 1. A peer connects: we add a row and spawn a heartbeat loop for it. The
//!    loop owns a child [`CancellationToken`] of the tracker's root token.
//! 2. Every `poll_interval` the loop checks whether `interval` has passed
//!    since its last probe. If so, it sends our signed attestation and waits
//!    at most `timeout` for the peer's.
//! 3. A reply that passes the replay guard overwrites the peer's row and
//!    triggers the cache pruner for that peer.
//! 4. A peer disconnects: its token is cancelled and its row removed. The
//!    loop exits at its next await point.
//!
//! Incoming heartbeats (the server side) go through the same
//! [`NodeStateTracker::observe`] path, so both directions keep rows fresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{
    HEARTBEAT_INTERVAL, HEARTBEAT_POLL_INTERVAL, HEARTBEAT_TIMEOUT, PEER_FRESHNESS_WINDOW,
};
use crate::consensus::attestation::{AttestationError, ReplayGuard, RoundAttestation};
use crate::consensus::pruner::CachePruner;
use crate::consensus::reporter::{Misbehavior, PeerReporter};
use crate::consensus::round::RoundKey;
use crate::consensus::state::ConsensusState;
use crate::crypto::keys::ArbiterKeypair;
use crate::crypto::signatures::SignatureVerifier;
use crate::network::rpc::PeerClient;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Minimum spacing between probes to the same peer.
    pub interval_ms: u64,
    /// Per-probe timeout.
    pub timeout_ms: u64,
    /// How often a heartbeat loop wakes to check whether a probe is due.
    pub poll_interval_ms: u64,
    /// A row older than this is stale for wait-set purposes.
    pub freshness_window_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
            timeout_ms: HEARTBEAT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: HEARTBEAT_POLL_INTERVAL.as_millis() as u64,
            freshness_window_ms: PEER_FRESHNESS_WINDOW.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Peer Node State
// ---------------------------------------------------------------------------

/// Last known round state of one connected adjudicator.
#[derive(Clone)]
pub struct PeerNodeState {
    pub address: String,
    /// Last finalized height the peer reported.
    pub height: u64,
    pub phase: u32,
    pub finalized: bool,
    /// `None` until the first heartbeat lands.
    pub updated_at: Option<Instant>,
    pub client: Arc<dyn PeerClient>,
}

impl PeerNodeState {
    fn connected(client: Arc<dyn PeerClient>) -> Self {
        Self {
            address: client.remote_address().to_owned(),
            height: 0,
            phase: 0,
            finalized: false,
            updated_at: None,
            client,
        }
    }

    /// Whether the last update is younger than `window` at `now`.
    pub fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.updated_at
            .map(|at| now.saturating_duration_since(at) < window)
            .unwrap_or(false)
    }

    /// Whether, going by its last heartbeat, the peer could be publishing
    /// entries under `key`: its current phase, or the next one once the
    /// current phase is finalized (which may be phase 0 of the next height).
    pub fn may_publish(&self, key: RoundKey) -> bool {
        if self.updated_at.is_none() {
            return false;
        }
        let current = RoundKey::new(self.height + 1, self.phase);
        if key == current {
            return true;
        }
        self.finalized
            && (key == RoundKey::new(current.height, current.phase + 1)
                || key == RoundKey::new(current.height + 1, 0))
    }

    /// Serializable view for diagnostics and the status API.
    pub fn summary(&self, now: Instant) -> PeerSummary {
        PeerSummary {
            address: self.address.clone(),
            height: self.height,
            phase: self.phase,
            finalized: self.finalized,
            age_ms: self
                .updated_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }
}

impl fmt::Debug for PeerNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerNodeState")
            .field("address", &self.address)
            .field("height", &self.height)
            .field("phase", &self.phase)
            .field("finalized", &self.finalized)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// What the outside world gets to see of a peer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub address: String,
    pub height: u64,
    pub phase: u32,
    pub finalized: bool,
    /// Milliseconds since the last update, if there was one.
    pub age_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Peer Table
// ---------------------------------------------------------------------------

/// Concurrent map of connected peers, keyed by address.
#[derive(Default)]
pub struct PeerTable {
    peers: DashMap<String, PeerNodeState>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a row for a freshly connected peer, replacing any previous one.
    pub fn connect(&self, client: Arc<dyn PeerClient>) -> PeerNodeState {
        let row = PeerNodeState::connected(client);
        self.peers.insert(row.address.clone(), row.clone());
        row
    }

    pub fn disconnect(&self, address: &str) -> bool {
        self.peers.remove(address).is_some()
    }

    /// Overwrites a connected peer's reported state. Unknown addresses are
    /// ignored and yield `None`.
    pub fn record(
        &self,
        address: &str,
        height: u64,
        phase: u32,
        finalized: bool,
        at: Instant,
    ) -> Option<PeerNodeState> {
        let mut row = self.peers.get_mut(address)?;
        row.height = height;
        row.phase = phase;
        row.finalized = finalized;
        row.updated_at = Some(at);
        Some(row.clone())
    }

    pub fn get(&self, address: &str) -> Option<PeerNodeState> {
        self.peers.get(address).map(|row| row.value().clone())
    }

    /// Every row, sorted by address.
    pub fn snapshot(&self) -> Vec<PeerNodeState> {
        let mut rows: Vec<PeerNodeState> = self.peers.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        rows
    }

    /// Rows updated within `window` of `now`, sorted by address.
    pub fn fresh(&self, now: Instant, window: Duration) -> Vec<PeerNodeState> {
        let mut rows: Vec<PeerNodeState> = self
            .peers
            .iter()
            .filter(|r| r.value().is_fresh(now, window))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        rows
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let now = Instant::now();
        self.snapshot().iter().map(|p| p.summary(now)).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerTable")
            .field("peers", &self.peers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything a heartbeat loop needs, cheap to clone into each task.
#[derive(Clone)]
struct TrackerContext {
    keypair: ArbiterKeypair,
    state: Arc<ConsensusState>,
    table: Arc<PeerTable>,
    pruner: Arc<CachePruner>,
    replay: Arc<ReplayGuard>,
    verifier: Arc<dyn SignatureVerifier>,
    reporter: Arc<dyn PeerReporter>,
    config: HeartbeatConfig,
}

impl TrackerContext {
    fn observe(
        &self,
        peer: &str,
        attestation: &RoundAttestation,
    ) -> Result<Option<PeerNodeState>, AttestationError> {
        if let Err(e) = self.replay.admit(attestation, peer, self.verifier.as_ref()) {
            self.reporter
                .report(peer, Misbehavior::BadAttestation(e.to_string()));
            return Err(e);
        }

        let updated = self.table.record(
            peer,
            attestation.height,
            attestation.phase,
            attestation.finalized,
            Instant::now(),
        );
        if let Some(row) = &updated {
            trace!(
                peer,
                height = row.height,
                phase = row.phase,
                finalized = row.finalized,
                "peer state updated"
            );
            self.pruner.on_peer_update(row);
        }
        Ok(updated)
    }
}

/// Owns the peer table and one supervised heartbeat loop per peer.
pub struct NodeStateTracker {
    ctx: TrackerContext,
    root: CancellationToken,
    loops: Mutex<HashMap<String, HeartbeatHandle>>,
}

impl NodeStateTracker {
    pub fn new(
        keypair: ArbiterKeypair,
        state: Arc<ConsensusState>,
        table: Arc<PeerTable>,
        pruner: Arc<CachePruner>,
        verifier: Arc<dyn SignatureVerifier>,
        reporter: Arc<dyn PeerReporter>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            ctx: TrackerContext {
                keypair,
                state,
                table,
                pruner,
                replay: Arc::new(ReplayGuard::new()),
                verifier,
                reporter,
                config,
            },
            root: CancellationToken::new(),
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.ctx.table
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.ctx.config
    }

    /// Registers a connected peer and starts its heartbeat loop. Must be
    /// called from within a tokio runtime.
    pub fn connect(&self, client: Arc<dyn PeerClient>) {
        let address = client.remote_address().to_owned();
        self.ctx.table.connect(Arc::clone(&client));

        let cancel = self.root.child_token();
        let task = tokio::spawn(heartbeat_loop(self.ctx.clone(), client, cancel.clone()));

        let previous = self
            .loops
            .lock()
            .insert(address.clone(), HeartbeatHandle { cancel, task });
        if let Some(old) = previous {
            old.cancel.cancel();
        }
        info!(peer = %address, "peer connected");
    }

    /// Cancels the peer's heartbeat loop and removes its row.
    pub fn disconnect(&self, address: &str) -> bool {
        let handle = self.loops.lock().remove(address);
        if let Some(handle) = &handle {
            handle.cancel.cancel();
        }
        let removed = self.ctx.table.disconnect(address);
        if removed {
            info!(peer = address, "peer disconnected");
        }
        removed || handle.is_some()
    }

    /// Our current state, signed for the wire.
    pub fn attest(&self) -> RoundAttestation {
        RoundAttestation::sign(&self.ctx.keypair, &self.ctx.state.snapshot())
    }

    /// Validates a peer's attestation and, if it passes, records it and runs
    /// the pruner for that peer.
    pub fn observe(
        &self,
        peer: &str,
        attestation: &RoundAttestation,
    ) -> Result<Option<PeerNodeState>, AttestationError> {
        self.ctx.observe(peer, attestation)
    }

    /// Number of running heartbeat loops.
    pub fn active_loops(&self) -> usize {
        self.loops
            .lock()
            .values()
            .filter(|h| !h.task.is_finished())
            .count()
    }

    /// Cancels every heartbeat loop and waits for them to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<HeartbeatHandle> = self.loops.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.task.await;
        }
        debug!("node state tracker stopped");
    }
}

impl Drop for NodeStateTracker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl fmt::Debug for NodeStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStateTracker")
            .field("address", &self.ctx.keypair.address())
            .field("peers", &self.ctx.table.len())
            .finish_non_exhaustive()
    }
}

async fn heartbeat_loop(ctx: TrackerContext, client: Arc<dyn PeerClient>, cancel: CancellationToken) {
    let peer = client.remote_address().to_owned();
    let mut last_probe: Option<Instant> = None;

    loop {
        let due = last_probe
            .map(|at| Instant::now().saturating_duration_since(at) >= ctx.config.interval())
            .unwrap_or(true);

        if due {
            last_probe = Some(Instant::now());
            let attestation = RoundAttestation::sign(&ctx.keypair, &ctx.state.snapshot());
            let probe = tokio::time::timeout(
                ctx.config.timeout(),
                client.request_round_state(attestation),
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = probe => result,
            };

            match result {
                Ok(Ok(reply)) => {
                    if let Err(e) = ctx.observe(&peer, &reply) {
                        debug!(peer = %peer, error = %e, "heartbeat reply refused");
                    }
                }
                Ok(Err(e)) => trace!(peer = %peer, error = %e, "heartbeat failed"),
                Err(_) => trace!(peer = %peer, "heartbeat timed out"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.poll_interval()) => {}
        }
    }

    trace!(peer = %peer, "heartbeat loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::cache::RoundCache;
    use crate::consensus::reporter::testing::RecordingReporter;
    use crate::consensus::round::{EntryKind, SignedEntry};
    use crate::crypto::signatures::Ed25519Verifier;
    use crate::network::rpc::{GossipReply, GossipRequest, RpcError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers heartbeats with a fixed remote state and counts probes.
    struct StubPeer {
        keypair: ArbiterKeypair,
        address: String,
        state: ConsensusState,
        probes: AtomicUsize,
    }

    impl StubPeer {
        fn new(height: u64, phase: u32) -> Arc<Self> {
            let keypair = ArbiterKeypair::generate();
            let state = ConsensusState::new(height);
            state.begin_phase(phase);
            Arc::new(Self {
                address: keypair.address(),
                keypair,
                state,
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PeerClient for StubPeer {
        fn remote_address(&self) -> &str {
            &self.address
        }

        async fn request_round_state(
            &self,
            _attestation: RoundAttestation,
        ) -> Result<RoundAttestation, RpcError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(RoundAttestation::sign(&self.keypair, &self.state.snapshot()))
        }

        async fn request_contribution(&self, _: GossipRequest) -> Result<GossipReply, RpcError> {
            Err(RpcError::Unreachable(self.address.clone()))
        }

        async fn request_hash(&self, _: GossipRequest) -> Result<GossipReply, RpcError> {
            Err(RpcError::Unreachable(self.address.clone()))
        }
    }

    struct Harness {
        tracker: NodeStateTracker,
        contributions: Arc<RoundCache>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness() -> Harness {
        let state = Arc::new(ConsensusState::new(4));
        let contributions = Arc::new(RoundCache::new(EntryKind::Contribution));
        let hashes = Arc::new(RoundCache::new(EntryKind::Hash));
        let pruner = Arc::new(CachePruner::new(
            contributions.clone(),
            hashes,
            state.clone(),
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let tracker = NodeStateTracker::new(
            ArbiterKeypair::generate(),
            state,
            Arc::new(PeerTable::new()),
            pruner,
            Arc::new(Ed25519Verifier),
            reporter.clone(),
            HeartbeatConfig::default(),
        );
        Harness {
            tracker,
            contributions,
            reporter,
        }
    }

    // 1. Connecting a peer starts heartbeats that fill in its row.
    #[tokio::test(start_paused = true)]
    async fn heartbeat_updates_peer_row() {
        let h = harness();
        let peer = StubPeer::new(4, 2);
        h.tracker.connect(peer.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = h.tracker.table().get(&peer.address).unwrap();
        assert_eq!(row.height, 4);
        assert_eq!(row.phase, 2);
        assert!(row.is_fresh(Instant::now(), Duration::from_secs(2)));
    }

    // 2. Probes are throttled to one per interval.
    #[tokio::test(start_paused = true)]
    async fn probes_are_self_throttled() {
        let h = harness();
        let peer = StubPeer::new(4, 0);
        h.tracker.connect(peer.clone());

        tokio::time::sleep(Duration::from_millis(3_050)).await;
        let probes = peer.probes.load(Ordering::SeqCst);
        assert!((3..=4).contains(&probes), "got {probes} probes");
    }

    // 3. Disconnecting cancels the loop and drops the row.
    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_heartbeats() {
        let h = harness();
        let peer = StubPeer::new(4, 0);
        h.tracker.connect(peer.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.tracker.disconnect(&peer.address));
        assert!(h.tracker.table().get(&peer.address).is_none());

        let before = peer.probes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(peer.probes.load(Ordering::SeqCst), before);
        assert_eq!(h.tracker.active_loops(), 0);
    }

    // 4. Heartbeat updates trigger the pruner for that peer.
    #[tokio::test(start_paused = true)]
    async fn heartbeat_runs_pruner() {
        let h = harness();
        let peer = StubPeer::new(4, 6);
        // Active key is (5, 0); (5, 3) is outside the window and matches
        // neither the peer's phase nor the active phase.
        let stale = RoundKey::new(5, 3);
        h.contributions
            .insert_if_absent(stale, &peer.address, SignedEntry::new("v", "s"));

        h.tracker.connect(peer.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.contributions.contains(stale, &peer.address));
    }

    // 5. Forged or mismatched attestations are refused and reported.
    #[tokio::test(start_paused = true)]
    async fn foreign_attestation_is_reported() {
        let h = harness();
        let peer = StubPeer::new(4, 0);
        h.tracker.table().connect(peer.clone());

        let impostor = StubPeer::new(9, 9);
        let forged = RoundAttestation::sign(&impostor.keypair, &impostor.state.snapshot());
        assert!(h.tracker.observe(&peer.address, &forged).is_err());
        assert_eq!(h.tracker.table().get(&peer.address).unwrap().height, 0);
        assert_eq!(h.reporter.reports.lock().len(), 1);
    }

    // 6. Shutdown drains every loop.
    #[tokio::test(start_paused = true)]
    async fn shutdown_joins_all_loops() {
        let h = harness();
        for _ in 0..3 {
            h.tracker.connect(StubPeer::new(4, 0));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.tracker.shutdown().await;
        assert_eq!(h.tracker.active_loops(), 0);
    }

    #[test]
    fn fresh_filters_by_window() {
        let table = PeerTable::new();
        let a = StubPeer::new(1, 0);
        let b = StubPeer::new(1, 0);
        table.connect(a.clone());
        table.connect(b.clone());

        let start = Instant::now();
        table.record(&a.address, 1, 0, false, start);
        table.record(&b.address, 1, 0, false, start - Duration::from_secs(5));

        let fresh = table.fresh(start, Duration::from_secs(2));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].address, a.address);
        assert!(table.record("unknown", 1, 0, false, start).is_none());
    }

    #[test]
    fn publishable_keys_follow_reported_round() {
        let mut peer = PeerNodeState::connected(StubPeer::new(4, 1));
        // No heartbeat yet: nothing is plausible.
        assert!(!peer.may_publish(RoundKey::new(5, 0)));

        peer.updated_at = Some(Instant::now());
        peer.height = 4;
        peer.phase = 1;
        assert!(peer.may_publish(RoundKey::new(5, 1)));
        assert!(!peer.may_publish(RoundKey::new(5, 2)));
        assert!(!peer.may_publish(RoundKey::new(5, 0)));
        assert!(!peer.may_publish(RoundKey::new(1_000_000, 7)));

        peer.finalized = true;
        assert!(peer.may_publish(RoundKey::new(5, 2)));
        assert!(peer.may_publish(RoundKey::new(6, 0)));
        assert!(!peer.may_publish(RoundKey::new(5, 3)));
    }
}
