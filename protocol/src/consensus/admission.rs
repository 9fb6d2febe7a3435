//! Entry admission.
//!
//! The single gate every remote entry passes through before it lands in a
//! round cache, whether it arrived as a gossip reply or was offered by a
//! caller on the server side. Checks run cheapest first:
//!
//! 1. the round key lies in the admission window of the active key,
//! 2. the value fits in `MAX_ENTRY_BYTES`,
//! 3. the address is a current signing member,
//! 4. the signature verifies for that address.
//!
//! Failing 1 is lateness or impatience, and the entry is dropped quietly.
//! Failing 2-4 is misbehaviour and gets reported against the peer that
//! delivered the entry.

use std::sync::Arc;

use tracing::trace;

use crate::config::MAX_ENTRY_BYTES;
use crate::consensus::cache::RoundCache;
use crate::consensus::membership::MembershipAuthority;
use crate::consensus::reporter::{Misbehavior, PeerReporter};
use crate::consensus::round::{RoundKey, SignedEntry};
use crate::consensus::state::ConsensusState;
use crate::crypto::signatures::SignatureVerifier;

/// What happened to an entry that passed authentication (or didn't need to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    Inserted,
    /// The address already had an entry under that key; the first one stays.
    Duplicate,
    /// The key is behind the retention window. Dropped, not an offence.
    Late,
    /// The key is ahead of the admission window. Dropped, not an offence.
    Premature,
}

#[derive(Clone)]
pub struct Admission {
    state: Arc<ConsensusState>,
    membership: Arc<dyn MembershipAuthority>,
    verifier: Arc<dyn SignatureVerifier>,
    reporter: Arc<dyn PeerReporter>,
}

impl Admission {
    pub fn new(
        state: Arc<ConsensusState>,
        membership: Arc<dyn MembershipAuthority>,
        verifier: Arc<dyn SignatureVerifier>,
        reporter: Arc<dyn PeerReporter>,
    ) -> Self {
        Self {
            state,
            membership,
            verifier,
            reporter,
        }
    }

    pub fn reporter(&self) -> &Arc<dyn PeerReporter> {
        &self.reporter
    }

    /// Checks `entry` for `address` under `key` and merges it into `cache`.
    /// `peer` is whoever handed us the entry; offences are reported against
    /// it and returned.
    pub fn admit(
        &self,
        peer: &str,
        cache: &RoundCache,
        key: RoundKey,
        address: &str,
        entry: SignedEntry,
    ) -> Result<Admitted, Misbehavior> {
        let active = self.state.snapshot().active_key();
        if key.is_behind_window(active) {
            trace!(peer, %key, %active, "late entry dropped");
            return Ok(Admitted::Late);
        }
        if !key.in_admission_window(active) {
            trace!(peer, %key, %active, "premature entry dropped");
            return Ok(Admitted::Premature);
        }
        cache.set_active(active);

        if let Err(offense) = self.authenticate(cache, key, address, &entry) {
            self.reporter.report(peer, offense.clone());
            return Err(offense);
        }

        if cache.insert_if_absent(key, address, entry) {
            Ok(Admitted::Inserted)
        } else {
            Ok(Admitted::Duplicate)
        }
    }

    fn authenticate(
        &self,
        cache: &RoundCache,
        key: RoundKey,
        address: &str,
        entry: &SignedEntry,
    ) -> Result<(), Misbehavior> {
        if entry.value.len() > MAX_ENTRY_BYTES {
            return Err(Misbehavior::Oversized {
                size: entry.value.len(),
                max: MAX_ENTRY_BYTES,
            });
        }
        if !self.membership.is_member(address) {
            return Err(Misbehavior::UnknownSigner {
                address: address.to_owned(),
            });
        }
        let message = cache.kind().signing_message(key, &entry.value);
        if !self.verifier.verify(address, &message, &entry.signature) {
            return Err(Misbehavior::BadSignature {
                address: address.to_owned(),
            });
        }
        Ok(())
    }
}
