//! # Protocol Configuration & Constants
//!
//! Every magic number in ARBITER lives here. If you're hardcoding a timeout
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these values are tuned against the adjudicator round protocol:
//! heartbeats drive peer freshness, freshness drives the wait-set, and the
//! wait-set decides how long a round is willing to sit around. Changing one
//! without thinking about the others is how you get a network that either
//! never finalizes or finalizes with half the contributions missing.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full version string of the round protocol.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version for peer RPC frames. Separate from the crate version
/// because transport changes don't always mean round-protocol changes.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Signing Domains
// ---------------------------------------------------------------------------

/// Domain tag prepended to contribution payloads before signing.
pub const CONTRIBUTION_DOMAIN: &[u8] = b"arbiter/contribution\x00";

/// Domain tag prepended to round-set digests before signing.
pub const HASH_DOMAIN: &[u8] = b"arbiter/hash\x00";

/// Domain tag prepended to heartbeat attestations before signing.
pub const ATTESTATION_DOMAIN: &[u8] = b"arbiter/attestation\x00";

// ---------------------------------------------------------------------------
// Round Timing
// ---------------------------------------------------------------------------

/// Data-collection deadline for the first phase of a height. Initial rounds
/// wait for full quorum parity, so they get a generous window.
pub const INITIAL_COLLECTION_DEADLINE: Duration = Duration::from_secs(30);

/// Data-collection deadline for every later phase of a height.
pub const FOLLOWUP_COLLECTION_DEADLINE: Duration = Duration::from_secs(6);

/// Grace period after which a non-initial round stops waiting for laggards.
pub const COLLECTION_GRACE: Duration = Duration::from_secs(2);

/// Settle delay before the hash tally is allowed to give up early.
pub const TALLY_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default deadline for the hash-commit tally.
pub const FINALIZE_TIMEOUT: Duration = Duration::from_secs(6);

/// Upper bound on how long a finished round waits for behind peers.
pub const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator spin-wait poll interval.
pub const COORDINATOR_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Gossip-fill yield between request batches.
pub const GOSSIP_BATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Per-call timeout for gossip requests.
pub const GOSSIP_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before the round driver retries a failed round.
pub const ROUND_RETRY_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Peer Tracking
// ---------------------------------------------------------------------------

/// Minimum spacing between heartbeat probes to the same peer.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-call timeout for heartbeat requests.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// How often the heartbeat loop wakes up to check whether a probe is due.
pub const HEARTBEAT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A peer whose last heartbeat is older than this is not considered when
/// sizing the wait-set.
pub const PEER_FRESHNESS_WINDOW: Duration = Duration::from_secs(2);

/// Maximum wall-clock drift tolerated on heartbeat attestations.
pub const MAX_ATTESTATION_SKEW: Duration = Duration::from_secs(30);

/// Capacity of the attestation replay guard.
pub const REPLAY_CACHE_SIZE: usize = 16_384;

// ---------------------------------------------------------------------------
// Cache & Message Limits
// ---------------------------------------------------------------------------

/// Hard cap on the number of round keys held by each round cache.
pub const ROUND_CACHE_CAPACITY: usize = 100;

/// Maximum size of a single contribution payload or digest, in bytes.
pub const MAX_ENTRY_BYTES: usize = 64 * 1024;

/// Maximum number of missing addresses a single gossip request may carry.
pub const MAX_MISSING_PER_REQUEST: usize = 256;

/// Maximum encoded size of a peer RPC frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default HTTP status/API port.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

/// Maximum number of connected adjudicator peers.
pub const MAX_PEERS: usize = 128;
