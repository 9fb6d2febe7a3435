//! # Round Server
//!
//! The receiving end of the three peer RPCs. Every gossip call first tries
//! to admit the caller's own offered entry, then answers with the first
//! requested address we hold, or our state summary if we hold none of them.
//!
//! An offer is only considered when it is signed for the caller's own
//! address and its key matches the round the caller last heartbeated
//! (see [`PeerNodeState::may_publish`](crate::consensus::tracker::PeerNodeState::may_publish)). It then goes through the same
//! admission checks as a gossip merge.

use std::sync::Arc;

use tracing::trace;

use crate::config::MAX_MISSING_PER_REQUEST;
use crate::consensus::admission::Admission;
use crate::consensus::attestation::RoundAttestation;
use crate::consensus::cache::RoundCache;
use crate::consensus::reporter::Misbehavior;
use crate::consensus::state::ConsensusState;
use crate::consensus::round::RoundKey;
use crate::consensus::tracker::NodeStateTracker;
use crate::network::rpc::{
    AddressedEntry, GossipReply, GossipRequest, RoundService, RpcError, StateSummary,
};

pub struct RoundServer {
    state: Arc<ConsensusState>,
    contributions: Arc<RoundCache>,
    hashes: Arc<RoundCache>,
    tracker: Arc<NodeStateTracker>,
    admission: Admission,
}

impl RoundServer {
    pub fn new(
        state: Arc<ConsensusState>,
        contributions: Arc<RoundCache>,
        hashes: Arc<RoundCache>,
        tracker: Arc<NodeStateTracker>,
        admission: Admission,
    ) -> Self {
        Self {
            state,
            contributions,
            hashes,
            tracker,
            admission,
        }
    }

    fn serve(
        &self,
        cache: &RoundCache,
        caller: &str,
        request: GossipRequest,
    ) -> Result<GossipReply, RpcError> {
        if request.missing.len() > MAX_MISSING_PER_REQUEST {
            let reason = format!(
                "{} missing addresses, limit is {}",
                request.missing.len(),
                MAX_MISSING_PER_REQUEST
            );
            self.admission
                .reporter()
                .report(caller, Misbehavior::Malformed(reason.clone()));
            return Err(RpcError::Malformed(reason));
        }

        if let Some(AddressedEntry { address, entry }) = request.offered {
            if address != caller {
                self.admission.reporter().report(
                    caller,
                    Misbehavior::Malformed(format!("offered entry for {}", address)),
                );
            } else if !self.caller_may_publish(caller, request.key) {
                trace!(caller, key = %request.key, "offer outside caller's reported round ignored");
            } else {
                // Offences are reported inside; the request is still answered.
                let _ = self
                    .admission
                    .admit(caller, cache, request.key, &address, entry);
            }
        }

        match cache.first_present(request.key, &request.missing) {
            Some((address, entry)) => {
                trace!(
                    caller,
                    key = %request.key,
                    address = %address,
                    kind = cache.kind().label(),
                    "serving entry"
                );
                Ok(GossipReply::Entry(AddressedEntry { address, entry }))
            }
            None => {
                let snapshot = self.state.snapshot();
                Ok(GossipReply::State(StateSummary {
                    height: snapshot.height,
                    phase: snapshot.phase,
                    finalized: snapshot.is_finalized(),
                }))
            }
        }
    }

    fn caller_may_publish(&self, caller: &str, key: RoundKey) -> bool {
        self.tracker
            .table()
            .get(caller)
            .is_some_and(|peer| peer.may_publish(key))
    }
}

impl RoundService for RoundServer {
    fn handle_round_state(
        &self,
        caller: &str,
        attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError> {
        self.tracker
            .observe(caller, &attestation)
            .map_err(|e| RpcError::Rejected(e.to_string()))?;
        Ok(self.tracker.attest())
    }

    fn handle_contribution(
        &self,
        caller: &str,
        request: GossipRequest,
    ) -> Result<GossipReply, RpcError> {
        self.serve(&self.contributions, caller, request)
    }

    fn handle_hash(&self, caller: &str, request: GossipRequest) -> Result<GossipReply, RpcError> {
        self.serve(&self.hashes, caller, request)
    }
}
