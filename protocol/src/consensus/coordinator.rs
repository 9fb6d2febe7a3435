//! # Round Coordinator
//!
//! Drives one round from "here is my contribution" to either a finalized,
//! majority-agreed contribution set or a failure the caller can retry.
//!
//! ## How it works
//!
//! 1. Sweep both caches down to the retention window, then publish our
//!    contribution under `(last finalized height + 1, phase)`.
//! 2. **Collection.** Spawn a contribution fill and poll every
//!    `poll_interval` until one of:
//!    - every wait-set peer's contribution is present,
//!    - the grace period is over and the round is not `Initial`,
//!    - the contribution count reaches the majority,
//!    - the collection deadline passes.
//!
//!    Fewer than majority contributions at that point fails the round.
//! 3. **Hash commit.** Digest the address-sorted contribution set, sign it,
//!    publish it in the hash cache, and spawn a hash fill.
//! 4. **Tally.** Count matching and mismatching digests among the signing
//!    members. Majority matches finalizes; majority mismatches fails; after
//!    the settle delay, fail as soon as matches plus pending wait-set peers
//!    can no longer reach the majority.
//! 5. **Catch-up.** Before returning success, wait (bounded) for fresh peers
//!    that are still behind this phase.
//!
//! If the chain height moves while collecting or tallying, the round quietly
//! restarts at the new height. Membership and the majority are re-read on
//! every poll.
//!
//! ## Failure
//!
//! `run_round` never returns an error. Quorum failures and sub-task panics
//! alike come back as [`RoundOutcome::Failed`], logged with a full snapshot
//! of peers and caches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{
    CATCH_UP_TIMEOUT, COLLECTION_GRACE, COORDINATOR_POLL_INTERVAL, FOLLOWUP_COLLECTION_DEADLINE,
    INITIAL_COLLECTION_DEADLINE, PEER_FRESHNESS_WINDOW, TALLY_SETTLE_DELAY,
};
use crate::consensus::cache::RoundCache;
use crate::consensus::gossip::{FillHandle, GossipExchanger};
use crate::consensus::membership::{majority, MembershipAuthority};
use crate::consensus::pruner::CachePruner;
use crate::consensus::round::{RoundFailure, RoundKey, RoundKind, RoundOutcome, SignedEntry};
use crate::consensus::state::ConsensusState;
use crate::consensus::tracker::{PeerNodeState, PeerTable};
use crate::crypto::hash::canonical_digest;
use crate::crypto::keys::ArbiterKeypair;
use crate::crypto::signatures::hash_message;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Round timing. Defaults come from `config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Collection deadline for `Initial` rounds.
    pub initial_collection_ms: u64,
    /// Collection deadline for `Middle` and `Last` rounds.
    pub followup_collection_ms: u64,
    /// After this, non-initial rounds stop waiting for the full wait-set.
    pub grace_ms: u64,
    /// The tally may only give up early after this long.
    pub settle_ms: u64,
    /// Upper bound on the post-finalization wait for behind peers.
    pub catch_up_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Heartbeat age beyond which a peer is ignored for wait-set purposes.
    pub freshness_window_ms: u64,
}

impl RoundConfig {
    pub fn collection_deadline(&self, kind: RoundKind) -> Duration {
        kind.collection_deadline(
            Duration::from_millis(self.initial_collection_ms),
            Duration::from_millis(self.followup_collection_ms),
        )
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.catch_up_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            initial_collection_ms: INITIAL_COLLECTION_DEADLINE.as_millis() as u64,
            followup_collection_ms: FOLLOWUP_COLLECTION_DEADLINE.as_millis() as u64,
            grace_ms: COLLECTION_GRACE.as_millis() as u64,
            settle_ms: TALLY_SETTLE_DELAY.as_millis() as u64,
            catch_up_timeout_ms: CATCH_UP_TIMEOUT.as_millis() as u64,
            poll_interval_ms: COORDINATOR_POLL_INTERVAL.as_millis() as u64,
            freshness_window_ms: PEER_FRESHNESS_WINDOW.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal stage results
// ---------------------------------------------------------------------------

enum Stage {
    /// The stage reached its goal.
    Done,
    /// The chain advanced underneath us; restart at the new height.
    HeightChanged,
}

impl From<tokio::task::JoinError> for RoundFailure {
    fn from(e: tokio::task::JoinError) -> Self {
        RoundFailure::Internal(format!("gossip task failed: {}", e))
    }
}

/// Key, address-sorted `(address, payload)` list and digest of a finalized round.
type Finalized = (RoundKey, Vec<(String, String)>, String);

/// Counts for one tally poll.
#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    matches: usize,
    mismatches: usize,
    pending: usize,
    need: usize,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Runs rounds for one adjudicator identity.
pub struct RoundCoordinator {
    keypair: ArbiterKeypair,
    address: String,
    state: Arc<ConsensusState>,
    membership: Arc<dyn MembershipAuthority>,
    table: Arc<PeerTable>,
    contributions: Arc<RoundCache>,
    hashes: Arc<RoundCache>,
    pruner: Arc<CachePruner>,
    contribution_gossip: Arc<GossipExchanger>,
    hash_gossip: Arc<GossipExchanger>,
    config: RoundConfig,
    ready: AtomicBool,
    cancel: CancellationToken,
}

impl RoundCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: ArbiterKeypair,
        state: Arc<ConsensusState>,
        membership: Arc<dyn MembershipAuthority>,
        table: Arc<PeerTable>,
        pruner: Arc<CachePruner>,
        contribution_gossip: Arc<GossipExchanger>,
        hash_gossip: Arc<GossipExchanger>,
        config: RoundConfig,
    ) -> Self {
        let contributions = contribution_gossip.cache();
        let hashes = hash_gossip.cache();
        Self {
            address: keypair.address(),
            keypair,
            state,
            membership,
            table,
            contributions,
            hashes,
            pruner,
            contribution_gossip,
            hash_gossip,
            config,
            ready: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// Whether the current round got past collection.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Cancels every fill spawned by this coordinator.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs one round at `phase` with our signed `payload`.
    ///
    /// `finalize_timeout` bounds the hash tally; `kind` picks the
    /// collection deadline and whether partial sets are accepted after the
    /// grace period.
    pub async fn run_round(
        &self,
        phase: u32,
        payload: String,
        signature: String,
        finalize_timeout: Duration,
        kind: RoundKind,
    ) -> RoundOutcome {
        let round_id = Uuid::new_v4();
        let span = info_span!("round", %round_id, phase, ?kind);

        async move {
            let started = Instant::now();
            let local = SignedEntry::new(payload, signature);
            let result = self.drive(phase, local, finalize_timeout, kind).await;

            match result {
                Ok((key, entries, digest)) => {
                    info!(
                        %key,
                        entries = entries.len(),
                        digest = %digest,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "round finalized"
                    );
                    RoundOutcome::Finalized {
                        key,
                        entries,
                        digest,
                    }
                }
                Err((key, reason)) => {
                    self.log_failure(key, &reason);
                    RoundOutcome::Failed { key, reason }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        phase: u32,
        local: SignedEntry,
        finalize_timeout: Duration,
        kind: RoundKind,
    ) -> Result<Finalized, (RoundKey, RoundFailure)> {
        self.ready.store(false, Ordering::SeqCst);

        loop {
            let height = self.state.height();
            let key = RoundKey::new(height + 1, phase);
            self.state.begin_phase(phase);

            self.pruner.sweep_window();
            self.contributions
                .insert_if_absent(key, &self.address, local.clone());
            debug!(%key, "contribution published");

            match self.collect(key, kind).await.map_err(|e| (key, e))? {
                Stage::HeightChanged => {
                    info!(%key, new_height = self.state.height(), "height changed during collection, restarting");
                    continue;
                }
                Stage::Done => {}
            }
            self.ready.store(true, Ordering::SeqCst);

            let entries = self.contributions.entries(key);
            let digest = canonical_digest(
                entries
                    .iter()
                    .map(|(address, entry)| (address.as_str(), entry.value.as_str())),
            );
            self.publish_hash(key, &digest);

            match self
                .tally(key, &digest, finalize_timeout)
                .await
                .map_err(|e| (key, e))?
            {
                Stage::HeightChanged => {
                    info!(%key, new_height = self.state.height(), "height changed during tally, restarting");
                    self.ready.store(false, Ordering::SeqCst);
                    continue;
                }
                Stage::Done => {}
            }

            self.state.finalize_phase(height, phase);
            self.await_catch_up(key).await;

            let entries = entries
                .into_iter()
                .map(|(address, entry)| (address, entry.value))
                .collect();
            return Ok((key, entries, digest));
        }
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    async fn collect(&self, key: RoundKey, kind: RoundKind) -> Result<Stage, RoundFailure> {
        let started = Instant::now();
        let deadline = self.config.collection_deadline(kind);
        let fill = self.spawn_fill(&self.contribution_gossip, key)?;

        loop {
            if self.height_moved(key) {
                fill.stop().await?;
                return Ok(Stage::HeightChanged);
            }

            let members = self.members()?;
            let need = majority(members.len());
            let present = self.contributions.addresses(key);
            let count = count_present(&members, &present);

            let wait_set = self.wait_set(key);
            let wait_set_complete =
                !wait_set.is_empty() && wait_set.iter().all(|a| present.contains(a));
            let grace_over =
                kind.accepts_partial_after_grace() && started.elapsed() >= self.config.grace();
            let timed_out = started.elapsed() >= deadline;

            if wait_set_complete || grace_over || count >= need || timed_out {
                fill.stop().await?;
                if count >= need {
                    debug!(%key, count, need, waited = wait_set.len(), "collection complete");
                    return Ok(Stage::Done);
                }
                return Err(RoundFailure::InsufficientContributions { have: count, need });
            }

            self.pause(&fill).await;
        }
    }

    // -----------------------------------------------------------------------
    // Hash commit & tally
    // -----------------------------------------------------------------------

    fn publish_hash(&self, key: RoundKey, digest: &str) {
        let signature = self.keypair.sign_hex(&hash_message(key, digest));
        // A retry at the same key may carry a different set; our own entry
        // always reflects the latest digest.
        self.hashes.remove_entry(key, &self.address);
        self.hashes
            .insert_if_absent(key, &self.address, SignedEntry::new(digest, signature));
        debug!(%key, digest, "hash published");
    }

    async fn tally(
        &self,
        key: RoundKey,
        digest: &str,
        finalize_timeout: Duration,
    ) -> Result<Stage, RoundFailure> {
        let started = Instant::now();
        let fill = self.spawn_fill(&self.hash_gossip, key)?;

        loop {
            if self.height_moved(key) {
                fill.stop().await?;
                return Ok(Stage::HeightChanged);
            }

            let tally = self.count_hashes(key, digest)?;

            let failure = if tally.matches >= tally.need {
                None
            } else if tally.mismatches >= tally.need {
                Some(RoundFailure::HashMismatch {
                    mismatches: tally.mismatches,
                    need: tally.need,
                })
            } else if started.elapsed() >= self.config.settle()
                && tally.matches + tally.pending < tally.need
            {
                Some(RoundFailure::MajorityUnreachable {
                    matches: tally.matches,
                    pending: tally.pending,
                    need: tally.need,
                })
            } else if started.elapsed() >= finalize_timeout {
                Some(RoundFailure::FinalizeTimeout {
                    matches: tally.matches,
                    need: tally.need,
                })
            } else {
                self.pause(&fill).await;
                continue;
            };

            fill.stop().await?;
            return match failure {
                None => {
                    debug!(%key, matches = tally.matches, need = tally.need, "hash majority reached");
                    Ok(Stage::Done)
                }
                Some(reason) => Err(reason),
            };
        }
    }

    fn count_hashes(&self, key: RoundKey, digest: &str) -> Result<Tally, RoundFailure> {
        let members = self.members()?;
        let hashes = self.hashes.entries(key);

        let mut tally = Tally {
            need: majority(members.len()),
            ..Tally::default()
        };
        for member in &members {
            match hashes.get(member) {
                Some(entry) if entry.value == digest => tally.matches += 1,
                Some(_) => tally.mismatches += 1,
                None => {}
            }
        }
        tally.pending = self
            .wait_set(key)
            .iter()
            .filter(|a| !hashes.contains_key(*a))
            .count();
        Ok(tally)
    }

    // -----------------------------------------------------------------------
    // Catch-up
    // -----------------------------------------------------------------------

    async fn await_catch_up(&self, key: RoundKey) {
        let deadline = Instant::now() + self.config.catch_up_timeout();
        loop {
            let behind: Vec<String> = self
                .fresh_members(key)
                .into_iter()
                .filter(|p| p.phase < key.phase || (p.phase == key.phase && !p.finalized))
                .map(|p| p.address)
                .collect();

            if behind.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                debug!(%key, behind = ?behind, "catch-up wait expired");
                return;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn spawn_fill(
        &self,
        exchanger: &Arc<GossipExchanger>,
        key: RoundKey,
    ) -> Result<FillHandle, RoundFailure> {
        let targets = self.members()?;
        Ok(exchanger.spawn_fill(key, targets, &self.cancel))
    }

    fn members(&self) -> Result<Vec<String>, RoundFailure> {
        let members = self.membership.signing_addresses();
        if members.is_empty() {
            return Err(RoundFailure::NoMembers);
        }
        Ok(members)
    }

    fn height_moved(&self, key: RoundKey) -> bool {
        self.state.height() + 1 != key.height
    }

    /// Sleeps one poll interval, waking early if the fill concludes.
    async fn pause(&self, fill: &FillHandle) {
        if fill.is_finished() {
            tokio::time::sleep(self.config.poll_interval()).await;
            return;
        }
        tokio::select! {
            _ = fill.finished() => {}
            _ = tokio::time::sleep(self.config.poll_interval()) => {}
        }
    }

    /// Fresh, member peers at the height this key decides.
    fn fresh_members(&self, key: RoundKey) -> Vec<PeerNodeState> {
        self.table
            .fresh(Instant::now(), self.config.freshness_window())
            .into_iter()
            .filter(|p| p.height + 1 == key.height && self.membership.is_member(&p.address))
            .collect()
    }

    /// Peers we must hear from before calling the round done.
    fn wait_set(&self, key: RoundKey) -> Vec<String> {
        self.fresh_members(key)
            .into_iter()
            .filter(|p| {
                p.phase == key.phase
                    || p.phase == key.phase + 1
                    || (key.phase > 0 && p.phase == key.phase - 1 && p.finalized)
            })
            .map(|p| p.address)
            .collect()
    }

    fn log_failure(&self, key: RoundKey, reason: &RoundFailure) {
        let state = self.state.snapshot();
        let peers = self.table.summaries();
        warn!(
            %key,
            reason = %reason,
            height = state.height,
            phase = state.phase,
            status = ?state.status,
            members = self.membership.signing_addresses().len(),
            contributions = self.contributions.count(key),
            hashes = self.hashes.count(key),
            contribution_keys = self.contributions.key_count(),
            hash_keys = self.hashes.key_count(),
            peers = ?peers,
            "round failed"
        );
    }
}

impl Drop for RoundCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn count_present(members: &[String], present: &HashSet<String>) -> usize {
    members.iter().filter(|m| present.contains(*m)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::admission::Admission;
    use crate::consensus::gossip::GossipConfig;
    use crate::consensus::membership::StaticMembership;
    use crate::consensus::reporter::LogReporter;
    use crate::consensus::round::EntryKind;
    use crate::crypto::signatures::{contribution_message, Ed25519Verifier};

    struct Solo {
        keypair: ArbiterKeypair,
        state: Arc<ConsensusState>,
        membership: Arc<StaticMembership>,
        coordinator: RoundCoordinator,
    }

    fn solo(extra_members: usize) -> Solo {
        let keypair = ArbiterKeypair::generate();
        let mut addresses = vec![keypair.address()];
        addresses.extend((0..extra_members).map(|_| ArbiterKeypair::generate().address()));

        let state = Arc::new(ConsensusState::new(0));
        let membership = Arc::new(StaticMembership::new(addresses));
        let table = Arc::new(PeerTable::new());
        let contributions = Arc::new(RoundCache::new(EntryKind::Contribution));
        let hashes = Arc::new(RoundCache::new(EntryKind::Hash));
        let pruner = Arc::new(CachePruner::new(
            contributions.clone(),
            hashes.clone(),
            state.clone(),
        ));
        let admission = Admission::new(
            state.clone(),
            membership.clone(),
            Arc::new(Ed25519Verifier),
            Arc::new(LogReporter),
        );
        let gossip = |cache: Arc<RoundCache>| {
            Arc::new(GossipExchanger::new(
                keypair.address(),
                cache,
                table.clone(),
                admission.clone(),
                GossipConfig::default(),
            ))
        };
        let coordinator = RoundCoordinator::new(
            keypair.clone(),
            state.clone(),
            membership.clone(),
            table.clone(),
            pruner,
            gossip(contributions),
            gossip(hashes),
            RoundConfig::default(),
        );
        Solo {
            keypair,
            state,
            membership,
            coordinator,
        }
    }

    async fn run(s: &Solo, phase: u32, payload: &str, kind: RoundKind) -> RoundOutcome {
        let signature = s.keypair.sign_hex(&contribution_message(payload));
        s.coordinator
            .run_round(phase, payload.to_string(), signature, Duration::from_secs(6), kind)
            .await
    }

    // 1. A lone member is its own majority.
    #[tokio::test(start_paused = true)]
    async fn single_member_finalizes_alone() {
        let s = solo(0);
        let outcome = run(&s, 0, "draw-7", RoundKind::Initial).await;

        assert!(outcome.is_finalized());
        assert_eq!(outcome.key(), RoundKey::new(1, 0));
        assert_eq!(
            outcome.entries().unwrap(),
            &[(s.keypair.address(), "draw-7".to_string())]
        );
        assert!(s.state.snapshot().is_finalized());
        assert!(s.coordinator.is_ready());
    }

    // 2. Without peers, an initial round waits out its deadline and fails.
    #[tokio::test(start_paused = true)]
    async fn isolated_member_fails_after_deadline() {
        let s = solo(2);
        let started = Instant::now();
        let outcome = run(&s, 0, "draw", RoundKind::Initial).await;

        assert_eq!(
            outcome,
            RoundOutcome::Failed {
                key: RoundKey::new(1, 0),
                reason: RoundFailure::InsufficientContributions { have: 1, need: 2 },
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(!s.coordinator.is_ready());
    }

    // 3. Later rounds give up after the grace period instead.
    #[tokio::test(start_paused = true)]
    async fn followup_round_fails_after_grace() {
        let s = solo(2);
        let started = Instant::now();
        let outcome = run(&s, 1, "draw", RoundKind::Middle).await;

        assert!(!outcome.is_finalized());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(6));
    }

    // 4. An empty membership is reported, not panicked on.
    #[tokio::test(start_paused = true)]
    async fn empty_membership_fails_cleanly() {
        let s = solo(0);
        s.membership.replace(Vec::<String>::new());
        let outcome = run(&s, 0, "draw", RoundKind::Initial).await;
        assert!(matches!(
            outcome,
            RoundOutcome::Failed {
                reason: RoundFailure::NoMembers,
                ..
            }
        ));
    }

    // 5. Height moving mid-collection restarts at the new height.
    #[tokio::test(start_paused = true)]
    async fn height_change_restarts_round() {
        let s = Arc::new(solo(2));
        let runner = {
            let s = s.clone();
            tokio::spawn(async move { run(&s, 0, "draw", RoundKind::Initial).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        s.state.advance_height(5);
        // Membership shrinks to us alone so the restarted round can finish.
        s.membership.replace([s.keypair.address()]);

        let outcome = runner.await.unwrap();
        assert!(outcome.is_finalized());
        assert_eq!(outcome.key(), RoundKey::new(6, 0));
    }
}
