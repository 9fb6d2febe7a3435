//! Round keys, entries and outcomes shared by every consensus component.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::signatures::{contribution_message, hash_message};

// ---------------------------------------------------------------------------
// Round Key
// ---------------------------------------------------------------------------

/// Identifies one negotiation instance: `(height, phase)`.
///
/// `height` is the height of the block being decided (last finalized + 1).
/// `phase` is an opaque, externally driven counter within that height. The
/// derived ordering is lexicographic, which is exactly the "oldest first"
/// order the cache evicts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundKey {
    /// Block height under negotiation.
    pub height: u64,
    /// Sub-negotiation counter within the height.
    pub phase: u32,
}

impl RoundKey {
    pub fn new(height: u64, phase: u32) -> Self {
        Self { height, phase }
    }

    /// Whether `self` lies in the retention window of the `active` key:
    /// `(H, P)`, `(H, P - 1)` or `(H + 1, 0)`.
    pub fn in_retention_window(&self, active: RoundKey) -> bool {
        if *self == active {
            return true;
        }
        if active.phase > 0 && *self == RoundKey::new(active.height, active.phase - 1) {
            return true;
        }
        *self == RoundKey::new(active.height + 1, 0)
    }

    /// Whether an entry under `self` may be admitted while `active` is being
    /// negotiated: the retention window plus the next phase `(H, P + 1)`,
    /// which peers that finalized `P` already publish into.
    pub fn in_admission_window(&self, active: RoundKey) -> bool {
        self.in_retention_window(active) || *self == RoundKey::new(active.height, active.phase + 1)
    }

    /// Whether `self` is strictly older than everything the window around
    /// `active` retains. Keys ahead of the window are not "behind".
    pub fn is_behind_window(&self, active: RoundKey) -> bool {
        let oldest_retained = RoundKey::new(active.height, active.phase.saturating_sub(1));
        *self < oldest_retained
    }
}

impl fmt::Display for RoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.phase)
    }
}

// ---------------------------------------------------------------------------
// Round Kind
// ---------------------------------------------------------------------------

/// Position of a phase within its height. Only affects timeout tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundKind {
    /// First phase of a height: long deadline, waits for full parity.
    Initial,
    /// Any intermediate phase.
    Middle,
    /// The phase whose result the block producer consumes.
    Last,
}

impl RoundKind {
    /// Whether a majority-sufficient set is accepted once the grace period
    /// has elapsed, instead of waiting for the full wait-set.
    pub fn accepts_partial_after_grace(self) -> bool {
        !matches!(self, RoundKind::Initial)
    }

    /// Picks the collection deadline for this kind.
    pub fn collection_deadline(self, initial: Duration, followup: Duration) -> Duration {
        match self {
            RoundKind::Initial => initial,
            RoundKind::Middle | RoundKind::Last => followup,
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Which of the two round caches an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A signed opaque payload.
    Contribution,
    /// A signed digest of a contribution set.
    Hash,
}

impl EntryKind {
    /// The exact bytes an entry of this kind is signed over.
    pub fn signing_message(self, key: RoundKey, value: &str) -> Vec<u8> {
        match self {
            EntryKind::Contribution => contribution_message(value),
            EntryKind::Hash => hash_message(key, value),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntryKind::Contribution => "contribution",
            EntryKind::Hash => "hash",
        }
    }
}

/// A signed value stored in a round cache: a payload for contributions, a
/// digest for hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub value: String,
    /// Hex-encoded signature over [`EntryKind::signing_message`].
    pub signature: String,
}

impl SignedEntry {
    pub fn new(value: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            signature: signature.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a round did not finalize.
///
/// None of these are fatal: the caller simply tries again at the next
/// opportunity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundFailure {
    /// Collection ended with fewer contributions than the majority.
    #[error("insufficient contributions: have {have}, need {need}")]
    InsufficientContributions { have: usize, need: usize },
    /// A majority of adjudicators committed to a different digest.
    #[error("hash mismatch: {mismatches} peers disagree, majority is {need}")]
    HashMismatch { mismatches: usize, need: usize },
    /// Even if every pending peer agreed, the majority is out of reach.
    #[error("majority unreachable: {matches} matches + {pending} pending < {need}")]
    MajorityUnreachable {
        matches: usize,
        pending: usize,
        need: usize,
    },
    /// The hash tally ran out of time.
    #[error("finalize timeout: {matches} matching hashes, need {need}")]
    FinalizeTimeout { matches: usize, need: usize },
    /// The membership authority returned an empty set.
    #[error("no signing addresses available")]
    NoMembers,
    /// Something unexpected blew up inside the round. Logged, not propagated.
    #[error("internal round error: {0}")]
    Internal(String),
}

/// The result of one `run_round` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The round finalized. `entries` is sorted by address.
    Finalized {
        key: RoundKey,
        entries: Vec<(String, String)>,
        digest: String,
    },
    /// The round failed; the caller decides when to retry.
    Failed { key: RoundKey, reason: RoundFailure },
}

impl RoundOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, RoundOutcome::Finalized { .. })
    }

    pub fn key(&self) -> RoundKey {
        match self {
            RoundOutcome::Finalized { key, .. } | RoundOutcome::Failed { key, .. } => *key,
        }
    }

    /// The finalized `(address, payload)` list, if any.
    pub fn entries(&self) -> Option<&[(String, String)]> {
        match self {
            RoundOutcome::Finalized { entries, .. } => Some(entries),
            RoundOutcome::Failed { .. } => None,
        }
    }
}
