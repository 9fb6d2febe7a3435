//! # Heartbeat Attestations
//!
//! Every heartbeat carries a signed statement of the sender's round state:
//! `(address, height, phase, finalized)` plus a wall-clock timestamp and a
//! random nonce. The transport already authenticates the channel; the
//! attestation lets the receiver reject replays and stale state on its own.
//!
//! ## Replay guard
//!
//! Receivers remember `(address, nonce)` pairs in a bounded `DashMap`. When
//! the guard outgrows its capacity, the oldest quarter (by attestation
//! timestamp) is evicted. Anything older than the skew window is rejected
//! before it reaches the guard, so evicted nonces can't be replayed either.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{MAX_ATTESTATION_SKEW, REPLAY_CACHE_SIZE};
use crate::consensus::state::ConsensusSnapshot;
use crate::crypto::keys::ArbiterKeypair;
use crate::crypto::signatures::{attestation_message, SignatureVerifier};

/// A signed snapshot of one adjudicator's round state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAttestation {
    pub address: String,
    /// Last finalized height.
    pub height: u64,
    pub phase: u32,
    pub finalized: bool,
    /// Unix milliseconds at signing time.
    pub timestamp_ms: i64,
    pub nonce: u64,
    pub signature: String,
}

impl RoundAttestation {
    /// Signs the given snapshot with a fresh nonce and the current time.
    pub fn sign(keypair: &ArbiterKeypair, snapshot: &ConsensusSnapshot) -> Self {
        Self::sign_at(
            keypair,
            snapshot,
            chrono::Utc::now().timestamp_millis(),
            rand::random(),
        )
    }

    pub(crate) fn sign_at(
        keypair: &ArbiterKeypair,
        snapshot: &ConsensusSnapshot,
        timestamp_ms: i64,
        nonce: u64,
    ) -> Self {
        let address = keypair.address();
        let finalized = snapshot.is_finalized();
        let message = attestation_message(
            &address,
            snapshot.height,
            snapshot.phase,
            finalized,
            timestamp_ms,
            nonce,
        );
        Self {
            signature: keypair.sign_hex(&message),
            address,
            height: snapshot.height,
            phase: snapshot.phase,
            finalized,
            timestamp_ms,
            nonce,
        }
    }

    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        let message = attestation_message(
            &self.address,
            self.height,
            self.phase,
            self.finalized,
            self.timestamp_ms,
            self.nonce,
        );
        verifier.verify(&self.address, &message, &self.signature)
    }
}

/// Why an attestation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttestationError {
    #[error("attestation signature does not verify for {0}")]
    BadSignature(String),
    #[error("attestation from {got} presented on a channel for {expected}")]
    Impersonation { expected: String, got: String },
    #[error("attestation clock skew of {skew_ms}ms exceeds limit")]
    Stale { skew_ms: i64 },
    #[error("attestation nonce {nonce} from {address} already seen")]
    Replayed { address: String, nonce: u64 },
}

/// Bounded memory of recently seen attestation nonces.
#[derive(Debug)]
pub struct ReplayGuard {
    seen: DashMap<(String, u64), i64>,
    capacity: usize,
    max_skew_ms: i64,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::with_limits(REPLAY_CACHE_SIZE, MAX_ATTESTATION_SKEW.as_millis() as i64)
    }

    pub fn with_limits(capacity: usize, max_skew_ms: i64) -> Self {
        Self {
            seen: DashMap::new(),
            capacity: capacity.max(4),
            max_skew_ms,
        }
    }

    /// Full admission check: signature, claimed identity, clock skew, nonce.
    pub fn admit(
        &self,
        attestation: &RoundAttestation,
        expected_address: &str,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(), AttestationError> {
        self.admit_at(
            attestation,
            expected_address,
            verifier,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn admit_at(
        &self,
        attestation: &RoundAttestation,
        expected_address: &str,
        verifier: &dyn SignatureVerifier,
        now_ms: i64,
    ) -> Result<(), AttestationError> {
        if attestation.address != expected_address {
            return Err(AttestationError::Impersonation {
                expected: expected_address.to_owned(),
                got: attestation.address.clone(),
            });
        }

        let skew_ms = (now_ms - attestation.timestamp_ms).abs();
        if skew_ms > self.max_skew_ms {
            return Err(AttestationError::Stale { skew_ms });
        }

        if !attestation.verify_signature(verifier) {
            return Err(AttestationError::BadSignature(attestation.address.clone()));
        }

        let slot = (attestation.address.clone(), attestation.nonce);
        if self.seen.insert(slot, attestation.timestamp_ms).is_some() {
            return Err(AttestationError::Replayed {
                address: attestation.address.clone(),
                nonce: attestation.nonce,
            });
        }

        self.maybe_evict();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn maybe_evict(&self) {
        if self.seen.len() <= self.capacity {
            return;
        }

        let target = self.capacity * 3 / 4;
        let mut entries: Vec<((String, u64), i64)> = self
            .seen
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);

        let to_remove = entries.len().saturating_sub(target);
        for (slot, _) in entries.into_iter().take(to_remove) {
            self.seen.remove(&slot);
        }
        trace!(removed = to_remove, "replay guard evicted old nonces");
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::ConsensusState;
    use crate::crypto::signatures::Ed25519Verifier;

    const NOW: i64 = 1_800_000_000_000;

    fn attest(kp: &ArbiterKeypair, nonce: u64, ts: i64) -> RoundAttestation {
        let state = ConsensusState::new(12);
        state.begin_phase(2);
        RoundAttestation::sign_at(kp, &state.snapshot(), ts, nonce)
    }

    #[test]
    fn valid_attestation_is_admitted_once() {
        let kp = ArbiterKeypair::generate();
        let guard = ReplayGuard::new();
        let att = attest(&kp, 1, NOW);
        assert_eq!(att.height, 12);
        assert_eq!(att.phase, 2);
        assert!(!att.finalized);

        assert!(guard.admit_at(&att, &kp.address(), &Ed25519Verifier, NOW).is_ok());
        assert!(matches!(
            guard.admit_at(&att, &kp.address(), &Ed25519Verifier, NOW),
            Err(AttestationError::Replayed { nonce: 1, .. })
        ));
    }

    #[test]
    fn tampered_attestation_is_rejected() {
        let kp = ArbiterKeypair::generate();
        let guard = ReplayGuard::new();
        let mut att = attest(&kp, 2, NOW);
        att.phase = 9;
        assert!(matches!(
            guard.admit_at(&att, &kp.address(), &Ed25519Verifier, NOW),
            Err(AttestationError::BadSignature(_))
        ));
        // A rejected attestation must not burn its nonce.
        assert!(guard.is_empty());
    }

    #[test]
    fn stale_attestation_is_rejected() {
        let kp = ArbiterKeypair::generate();
        let guard = ReplayGuard::with_limits(64, 30_000);
        let att = attest(&kp, 3, NOW - 60_000);
        assert!(matches!(
            guard.admit_at(&att, &kp.address(), &Ed25519Verifier, NOW),
            Err(AttestationError::Stale { skew_ms: 60_000 })
        ));
    }

    #[test]
    fn attestation_for_other_identity_is_rejected() {
        let kp = ArbiterKeypair::generate();
        let other = ArbiterKeypair::generate();
        let guard = ReplayGuard::new();
        let att = attest(&kp, 4, NOW);
        assert!(matches!(
            guard.admit_at(&att, &other.address(), &Ed25519Verifier, NOW),
            Err(AttestationError::Impersonation { .. })
        ));
    }

    #[test]
    fn guard_stays_bounded() {
        let kp = ArbiterKeypair::generate();
        let guard = ReplayGuard::with_limits(8, 30_000);
        for nonce in 0..20u64 {
            let att = attest(&kp, nonce, NOW + nonce as i64);
            guard
                .admit_at(&att, &kp.address(), &Ed25519Verifier, NOW)
                .unwrap();
        }
        assert!(guard.len() <= 8);
    }
}
