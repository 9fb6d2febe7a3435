//! # Adjudicator Consensus
//!
//! Per-height agreement among the adjudicators of the permissioned chain.
//! Every block height is negotiated in a series of phases; in each phase
//! every adjudicator contributes a signed payload, the set of contributions
//! is gossiped until a majority holds the same set, and a second gossip
//! round over the set's digest confirms that agreement.
//!
//! ## Architecture
//!
//! ```text
//! round.rs        — RoundKey, RoundKind, SignedEntry, RoundOutcome
//! state.rs        — Process-wide consensus state (height, phase, status)
//! membership.rs   — Signing-member authority and the majority rule
//! cache.rs        — Bounded, height-scoped per-address entry cache
//! attestation.rs  — Signed heartbeat payloads and replay protection
//! reporter.rs     — Misbehaviour reporting seam
//! admission.rs    — The checks every incoming entry goes through
//! tracker.rs      — Peer table and per-peer heartbeat loops
//! pruner.rs       — Evicts entries peers no longer need
//! gossip.rs       — Pull-based fill of missing entries from peers
//! coordinator.rs  — Runs one round end to end
//! server.rs       — Answers peer RPCs
//! driver.rs       — Long-running loop feeding rounds to the coordinator
//! election.rs     — Deterministic block producer election
//! ```
//!
//! ## Design Decisions
//!
//! - Caches are keyed by `(height, phase)` and keep only a sliding window of
//!   heights. Nothing behind the window is ever admitted again.
//! - The first entry seen for an address under a key wins. Gossip is
//!   idempotent; a peer cannot overwrite what it already sent.
//! - Peer state is written only from verified heartbeats. Gossip replies
//!   carry a state summary for logging, never for the wait-set.
//! - All waiting is done with `tokio::time`, so tests run on a paused clock.

pub mod admission;
pub mod attestation;
pub mod cache;
pub mod coordinator;
pub mod driver;
pub mod election;
pub mod gossip;
pub mod membership;
pub mod pruner;
pub mod reporter;
pub mod round;
pub mod server;
pub mod state;
pub mod tracker;

pub use admission::{Admission, Admitted};
pub use attestation::{AttestationError, ReplayGuard, RoundAttestation};
pub use cache::RoundCache;
pub use coordinator::{RoundConfig, RoundCoordinator};
pub use driver::{
    DriverConfig, DriverError, DriverStats, PhasePlan, RoundApplication, RoundDriver,
};
pub use election::elect_producer;
pub use gossip::{FillHandle, GossipConfig, GossipExchanger};
pub use membership::{majority, MembershipAuthority, StaticMembership};
pub use pruner::{CachePruner, PruneReport};
pub use reporter::{LogReporter, Misbehavior, PeerReporter};
pub use round::{EntryKind, RoundFailure, RoundKey, RoundKind, RoundOutcome, SignedEntry};
pub use server::RoundServer;
pub use state::{ConsensusSnapshot, ConsensusState, RoundStatus};
pub use tracker::{HeartbeatConfig, NodeStateTracker, PeerNodeState, PeerSummary, PeerTable};
