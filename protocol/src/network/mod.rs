//! # Network Module
//!
//! Transport-facing side of the adjudicator protocol.
//!
//! ## Architecture
//!
//! ```text
//! rpc.rs     — Peer RPC wire types and the client/service traits
//! memory.rs  — In-process transport with bincode framing and partitions
//! ```
//!
//! ## Design Decisions
//!
//! - The round protocol only sees `PeerClient` and `RoundService`. Anything
//!   that can move a bincode frame between two adjudicators can carry it.
//! - `caller` on the service side is the transport-authenticated address.
//!   Heartbeat attestations are still signature-checked against it.
//! - Every frame carries `WIRE_PROTOCOL_VERSION` and is bounded by
//!   `MAX_FRAME_BYTES`, in memory as on a socket.

pub mod memory;
pub mod rpc;

pub use memory::{MemoryClient, MemoryNetwork};
pub use rpc::{
    AddressedEntry, GossipReply, GossipRequest, PeerClient, RoundService, RpcError, StateSummary,
};
