//! # Peer RPC Surface
//!
//! The three calls adjudicators make to one another, expressed as a client
//! trait ([`PeerClient`]) and a server trait ([`RoundService`]). The round
//! protocol only ever talks to these traits; how a frame actually gets to the
//! other side is the transport's problem.
//!
//! | Call                   | Request              | Reply                   |
//! |------------------------|----------------------|-------------------------|
//! | `request_round_state`  | `RoundAttestation`   | `RoundAttestation`      |
//! | `request_contribution` | `GossipRequest`      | `GossipReply`           |
//! | `request_hash`         | `GossipRequest`      | `GossipReply`           |
//!
//! A gossip reply is either one verified entry the caller was missing, or a
//! summary of the responder's round state when it has nothing to offer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::consensus::attestation::RoundAttestation;
use crate::consensus::round::{EntryKind, RoundKey, SignedEntry};

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

/// An entry attributed to an adjudicator address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressedEntry {
    pub address: String,
    pub entry: SignedEntry,
}

/// Pull request for entries the caller is missing under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRequest {
    pub key: RoundKey,
    /// Addresses the caller has no entry for, in the order it prefers.
    pub missing: Vec<String>,
    /// The caller's own entry, sent at most once per peer per fill cycle.
    pub offered: Option<AddressedEntry>,
}

/// Where the responder stands, returned when it has nothing to hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub height: u64,
    pub phase: u32,
    pub finalized: bool,
}

/// Answer to a [`GossipRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipReply {
    Entry(AddressedEntry),
    State(StateSummary),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport and request-level failures. All of these are transient from the
/// round protocol's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("peer {0} is not reachable")]
    Unreachable(String),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Client & Service
// ---------------------------------------------------------------------------

/// Client half of a connection to one remote adjudicator.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Address of the adjudicator on the other end.
    fn remote_address(&self) -> &str;

    /// Heartbeat: send our attested state, receive theirs.
    async fn request_round_state(
        &self,
        attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError>;

    async fn request_contribution(&self, request: GossipRequest) -> Result<GossipReply, RpcError>;

    async fn request_hash(&self, request: GossipRequest) -> Result<GossipReply, RpcError>;

    /// Dispatches to the gossip call matching `kind`.
    async fn request_entry(
        &self,
        kind: EntryKind,
        request: GossipRequest,
    ) -> Result<GossipReply, RpcError> {
        match kind {
            EntryKind::Contribution => self.request_contribution(request).await,
            EntryKind::Hash => self.request_hash(request).await,
        }
    }
}

/// Server half: what a node does when a peer calls it. `caller` is the
/// transport-authenticated address of the remote adjudicator.
pub trait RoundService: Send + Sync {
    fn handle_round_state(
        &self,
        caller: &str,
        attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError>;

    fn handle_contribution(&self, caller: &str, request: GossipRequest)
        -> Result<GossipReply, RpcError>;

    fn handle_hash(&self, caller: &str, request: GossipRequest) -> Result<GossipReply, RpcError>;
}
