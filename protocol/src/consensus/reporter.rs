//! Misbehaviour reporting.
//!
//! Anything that fails authentication (bad signatures, spoofed addresses,
//! oversized or malformed requests, replayed attestations) is dropped on the
//! floor and handed to a [`PeerReporter`]. What happens next (reputation,
//! bans) belongs to whoever implements the trait.

use std::fmt;

use tracing::warn;

/// Categories of peer misbehaviour the round protocol can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Misbehavior {
    /// A signature did not verify against the claimed address.
    BadSignature { address: String },
    /// The claimed address is not a current signing member.
    UnknownSigner { address: String },
    /// A peer answered with an entry for an address we never asked for.
    Unsolicited { address: String },
    /// A value or request exceeded the protocol limits.
    Oversized { size: usize, max: usize },
    /// A request was structurally invalid.
    Malformed(String),
    /// A heartbeat attestation was refused.
    BadAttestation(String),
}

impl fmt::Display for Misbehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSignature { address } => write!(f, "bad signature for {}", address),
            Self::UnknownSigner { address } => write!(f, "{} is not a signing member", address),
            Self::Unsolicited { address } => write!(f, "unsolicited entry for {}", address),
            Self::Oversized { size, max } => write!(f, "{} bytes exceeds limit of {}", size, max),
            Self::Malformed(reason) => write!(f, "malformed request: {}", reason),
            Self::BadAttestation(reason) => write!(f, "bad attestation: {}", reason),
        }
    }
}

/// Sink for misbehaviour reports. `peer` is the transport-level identity of
/// the adjudicator that delivered the offending data.
pub trait PeerReporter: Send + Sync {
    fn report(&self, peer: &str, offense: Misbehavior);
}

/// Default reporter: a `warn!` line and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl PeerReporter for LogReporter {
    fn report(&self, peer: &str, offense: Misbehavior) {
        warn!(peer, offense = %offense, "peer misbehaviour");
    }
}
