//! # Gossip Fill
//!
//! Pull-based completion of a round's entry set. Given a round key and the
//! addresses we expect entries from, keep asking peers for whatever is still
//! missing until the set is complete or the owning round cancels us.
//!
//! ## How it works
//!
//! Each batch:
//!
//! 1. `missing = targets - cached`, shuffled so no address is always first.
//! 2. Every eligible peer (connected, reporting the round's height and
//!    phase, no request already in flight) gets a time-boxed request
//!    carrying a rotated slice of `missing`. Peer `i` of `n` starts at
//!    offset `i * len / n`, so concurrent peers are asked about interleaved
//!    subsets instead of all being asked for the same address.
//! 3. Our own entry rides along on the first request to each peer, and
//!    never again in this fill.
//! 4. Replies pass through [`Admission`] before merging. Entries for
//!    addresses we didn't ask about are reported as unsolicited.
//! 5. Wait out `batch_interval` (merging replies as they land), recompute,
//!    repeat. A peer that answers instantly is still asked at most once per
//!    interval.
//!
//! The same exchanger serves contributions and hash commitments; the cache
//! it is built over decides which RPC it calls and what gets verified.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

use crate::config::{GOSSIP_BATCH_INTERVAL, GOSSIP_REQUEST_TIMEOUT, MAX_MISSING_PER_REQUEST};
use crate::consensus::admission::{Admission, Admitted};
use crate::consensus::cache::RoundCache;
use crate::consensus::reporter::Misbehavior;
use crate::consensus::round::{EntryKind, RoundKey};
use crate::consensus::tracker::{PeerNodeState, PeerTable};
use crate::network::rpc::{AddressedEntry, GossipReply, GossipRequest, RpcError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Pause between request batches.
    pub batch_interval_ms: u64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl GossipConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: GOSSIP_BATCH_INTERVAL.as_millis() as u64,
            request_timeout_ms: GOSSIP_REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Fill Handle
// ---------------------------------------------------------------------------

/// Owner's grip on a running fill task.
///
/// Dropping the handle cancels the task, so a fill never outlives the round
/// that started it.
#[derive(Debug)]
pub struct FillHandle {
    cancel: CancellationToken,
    done: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FillHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the fill has concluded, for any reason.
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the fill has concluded. Safe to await repeatedly.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Cancels the fill and waits for the task to exit.
    pub async fn stop(mut self) -> Result<(), JoinError> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        }
    }
}

impl Drop for FillHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Exchanger
// ---------------------------------------------------------------------------

type Flight = (String, Result<Result<GossipReply, RpcError>, tokio::time::error::Elapsed>);

/// Gossip fill over one round cache.
pub struct GossipExchanger {
    local_address: String,
    cache: Arc<RoundCache>,
    table: Arc<PeerTable>,
    admission: Admission,
    config: GossipConfig,
}

impl GossipExchanger {
    pub fn new(
        local_address: impl Into<String>,
        cache: Arc<RoundCache>,
        table: Arc<PeerTable>,
        admission: Admission,
        config: GossipConfig,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            cache,
            table,
            admission,
            config,
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.cache.kind()
    }

    pub fn cache(&self) -> Arc<RoundCache> {
        Arc::clone(&self.cache)
    }

    /// Starts [`fill_missing`](Self::fill_missing) on its own task. The fill
    /// stops when `parent` or the returned handle is cancelled.
    pub fn spawn_fill(
        self: &Arc<Self>,
        key: RoundKey,
        targets: Vec<String>,
        parent: &CancellationToken,
    ) -> FillHandle {
        let cancel = parent.child_token();
        let done = CancellationToken::new();

        let this = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task_done = done.clone();
        let span = tracing::debug_span!("fill", kind = self.kind().label(), %key);
        let task = tokio::spawn(
            async move {
                let _signal = task_done.drop_guard();
                this.fill_missing(key, targets, task_cancel).await;
            }
            .instrument(span),
        );

        FillHandle {
            cancel,
            done,
            task: Some(task),
        }
    }

    /// Requests entries for `targets` under `key` until none are missing or
    /// `cancel` fires.
    pub async fn fill_missing(&self, key: RoundKey, targets: Vec<String>, cancel: CancellationToken) {
        let mut in_flight: JoinSet<Flight> = JoinSet::new();
        // Task id -> peer, so a panicked request still frees its peer.
        let mut flights: HashMap<task::Id, String> = HashMap::new();
        let mut sent_to: HashSet<String> = HashSet::new();
        let mut merged = 0usize;

        'fill: loop {
            let missing = self.missing(key, &targets);
            if missing.is_empty() {
                debug!(merged, "fill complete");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let peers = self.eligible_peers(key);
            let peer_count = peers.len();
            for (index, peer) in peers.iter().enumerate() {
                if flights.values().any(|busy| busy == &peer.address) {
                    continue;
                }
                let request = GossipRequest {
                    key,
                    missing: rotated_slice(&missing, index, peer_count),
                    offered: self.offer_once(key, &peer.address, &mut sent_to),
                };

                let client = Arc::clone(&peer.client);
                let address = peer.address.clone();
                let kind = self.kind();
                let timeout = self.config.request_timeout();
                let flight = in_flight.spawn(async move {
                    let reply = tokio::time::timeout(timeout, client.request_entry(kind, request)).await;
                    (address, reply)
                });
                flights.insert(flight.id(), peer.address.clone());
            }

            // Replies merge as they land; the next batch waits out the interval.
            let window = tokio::time::sleep(self.config.batch_interval());
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'fill,
                    _ = &mut window => break,
                    Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                        match joined {
                            Ok((id, (peer, reply))) => {
                                flights.remove(&id);
                                if self.absorb(&peer, key, &missing, reply) {
                                    merged += 1;
                                    if self.missing(key, &targets).is_empty() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let peer = flights.remove(&e.id());
                                debug!(peer = ?peer, error = %e, "gossip request task failed");
                            }
                        }
                    }
                }
            }
        }

        in_flight.abort_all();
        trace!(merged, "fill loop exited");
    }

    /// Shuffled list of targets with no cached entry.
    fn missing(&self, key: RoundKey, targets: &[String]) -> Vec<String> {
        let present = self.cache.addresses(key);
        let mut missing: Vec<String> = targets
            .iter()
            .filter(|a| !present.contains(*a))
            .cloned()
            .collect();
        missing.shuffle(&mut rand::thread_rng());
        missing
    }

    /// Connected peers that report the height and phase this key belongs to.
    fn eligible_peers(&self, key: RoundKey) -> Vec<PeerNodeState> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|p| {
                p.updated_at.is_some() && p.height + 1 == key.height && p.phase == key.phase
            })
            .collect()
    }

    fn offer_once(
        &self,
        key: RoundKey,
        peer: &str,
        sent_to: &mut HashSet<String>,
    ) -> Option<AddressedEntry> {
        if sent_to.contains(peer) {
            return None;
        }
        let entry = self.cache.get(key, &self.local_address)?;
        sent_to.insert(peer.to_owned());
        Some(AddressedEntry {
            address: self.local_address.clone(),
            entry,
        })
    }

    /// Merges one reply. Returns `true` if a new entry was cached.
    fn absorb(
        &self,
        peer: &str,
        key: RoundKey,
        missing: &[String],
        reply: Result<Result<GossipReply, RpcError>, tokio::time::error::Elapsed>,
    ) -> bool {
        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                trace!(peer, error = %e, "gossip request failed");
                return false;
            }
            Err(_) => {
                trace!(peer, "gossip request timed out");
                return false;
            }
        };

        let AddressedEntry { address, entry } = match reply {
            GossipReply::Entry(found) => found,
            GossipReply::State(summary) => {
                trace!(
                    peer,
                    height = summary.height,
                    phase = summary.phase,
                    finalized = summary.finalized,
                    "peer had nothing to offer"
                );
                return false;
            }
        };

        if !missing.contains(&address) {
            // Someone else may have delivered it since the request went out.
            if !self.cache.contains(key, &address) {
                self.admission
                    .reporter()
                    .report(peer, Misbehavior::Unsolicited { address });
            }
            return false;
        }

        match self.admission.admit(peer, &self.cache, key, &address, entry) {
            Ok(Admitted::Inserted) => {
                trace!(peer, address = %address, "gossip entry merged");
                true
            }
            Ok(_) | Err(_) => false,
        }
    }
}

/// `missing` rotated left by `index * len / peer_count`, capped at the
/// per-request limit.
fn rotated_slice(missing: &[String], index: usize, peer_count: usize) -> Vec<String> {
    if missing.is_empty() {
        return Vec::new();
    }
    let offset = index * missing.len() / peer_count.max(1);
    missing
        .iter()
        .cycle()
        .skip(offset % missing.len())
        .take(missing.len().min(MAX_MISSING_PER_REQUEST))
        .cloned()
        .collect()
}
