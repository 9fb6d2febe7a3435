//! # Cache Pruner
//!
//! Runs every time a peer reports new round state. It only ever writes to
//! the two round caches; it reads the peer's report and the local consensus
//! state and nothing else.
//!
//! ## Rules
//!
//! Keys inside the retention window of the active key are never touched
//! here. For every other key holding an entry from the reporting peer:
//!
//! - **Contributions**: drop the peer's entry if the key's phase is neither
//!   the peer's reported phase nor the locally active phase.
//! - **Hashes**: the same rule, plus a finalized peer loses its entries at
//!   any earlier phase, and a peer still processing loses its entry at the
//!   phase one ahead of its own.
//!
//! After the peer-scoped pass, both caches run their hard-cap eviction,
//! which spares the admission window of the active key.

use std::sync::Arc;

use tracing::debug;

use crate::consensus::cache::RoundCache;
use crate::consensus::round::RoundKey;
use crate::consensus::state::ConsensusState;
use crate::consensus::tracker::PeerNodeState;

/// How much one pruning pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub contributions: usize,
    pub hashes: usize,
    /// Whole round keys dropped by the hard-cap pass.
    pub evicted_keys: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.contributions == 0 && self.hashes == 0 && self.evicted_keys == 0
    }
}

#[derive(Debug, Clone)]
pub struct CachePruner {
    contributions: Arc<RoundCache>,
    hashes: Arc<RoundCache>,
    state: Arc<ConsensusState>,
}

impl CachePruner {
    pub fn new(
        contributions: Arc<RoundCache>,
        hashes: Arc<RoundCache>,
        state: Arc<ConsensusState>,
    ) -> Self {
        Self {
            contributions,
            hashes,
            state,
        }
    }

    pub fn on_peer_update(&self, peer: &PeerNodeState) -> PruneReport {
        self.prune_peer(&peer.address, peer.phase, peer.finalized)
    }

    /// Applies the peer-scoped rules for `address`, then the hard cap.
    pub fn prune_peer(&self, address: &str, peer_phase: u32, peer_finalized: bool) -> PruneReport {
        let active = self.state.snapshot().active_key();
        let mut report = PruneReport::default();

        for key in self.contributions.keys_containing(address) {
            if stale_contribution(key, active, peer_phase)
                && self.contributions.remove_entry(key, address)
            {
                report.contributions += 1;
            }
        }

        for key in self.hashes.keys_containing(address) {
            if stale_hash(key, active, peer_phase, peer_finalized)
                && self.hashes.remove_entry(key, address)
            {
                report.hashes += 1;
            }
        }

        self.contributions.set_active(active);
        self.hashes.set_active(active);
        report.evicted_keys =
            self.contributions.enforce_capacity() + self.hashes.enforce_capacity();

        if !report.is_empty() {
            debug!(
                peer = address,
                peer_phase,
                peer_finalized,
                %active,
                contributions = report.contributions,
                hashes = report.hashes,
                evicted_keys = report.evicted_keys,
                "pruned stale round entries"
            );
        }
        report
    }

    /// Drops every key behind the retention window in both caches.
    pub fn sweep_window(&self) -> usize {
        let active = self.state.snapshot().active_key();
        self.contributions.sweep_behind_window(active) + self.hashes.sweep_behind_window(active)
    }
}

fn stale_contribution(key: RoundKey, active: RoundKey, peer_phase: u32) -> bool {
    !key.in_retention_window(active) && key.phase != peer_phase && key.phase != active.phase
}

fn stale_hash(key: RoundKey, active: RoundKey, peer_phase: u32, peer_finalized: bool) -> bool {
    if key.in_retention_window(active) {
        return false;
    }
    if key.phase != peer_phase && key.phase != active.phase {
        return true;
    }
    if peer_finalized {
        key.phase < peer_phase
    } else {
        key.phase == peer_phase.saturating_add(1)
    }
}
