//! # In-Process Transport
//!
//! A [`PeerClient`] implementation that delivers calls to a [`RoundService`]
//! living in the same process. Every request and reply still goes through
//! bincode and the frame size limit, so serialization bugs show up here and
//! not for the first time on a real network.
//!
//! Links can be cut per pair or per address and restored, and every call
//! can be given a fixed delay. The multi-node round tests use these for
//! partitions, cut links and slow links.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{MAX_FRAME_BYTES, WIRE_PROTOCOL_VERSION};
use crate::consensus::attestation::RoundAttestation;
use crate::network::rpc::{GossipReply, GossipRequest, PeerClient, RoundService, RpcError};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u16,
    body: T,
}

#[derive(Debug, Serialize, Deserialize)]
enum RequestFrame {
    RoundState(RoundAttestation),
    Contribution(GossipRequest),
    Hash(GossipRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum ResponseFrame {
    RoundState(RoundAttestation),
    Gossip(GossipReply),
    Error(RpcError),
}

fn encode<T: Serialize>(body: T) -> Result<Vec<u8>, RpcError> {
    let bytes = bincode::serialize(&Envelope {
        version: WIRE_PROTOCOL_VERSION,
        body,
    })
    .map_err(|e| RpcError::Codec(e.to_string()))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    let envelope: Envelope<T> =
        bincode::deserialize(bytes).map_err(|e| RpcError::Codec(e.to_string()))?;
    if envelope.version != WIRE_PROTOCOL_VERSION {
        return Err(RpcError::Codec(format!(
            "wire version {} not supported",
            envelope.version
        )));
    }
    Ok(envelope.body)
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// A switchboard of in-process round services.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    services: DashMap<String, Weak<dyn RoundService>>,
    cut: RwLock<HashSet<(String, String)>>,
    latency: RwLock<Duration>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `service` reachable as `address`. The network only holds a
    /// weak reference; dropping the service takes it offline.
    pub fn register(&self, address: impl Into<String>, service: &Arc<dyn RoundService>) {
        self.services.insert(address.into(), Arc::downgrade(service));
    }

    pub fn unregister(&self, address: &str) {
        self.services.remove(address);
    }

    /// A client for calls from `local` to `remote`.
    pub fn client(self: &Arc<Self>, local: &str, remote: &str) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            network: Arc::clone(self),
            local: local.to_owned(),
            remote: remote.to_owned(),
        })
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut cut = self.cut.write();
        cut.insert((a.to_owned(), b.to_owned()));
        cut.insert((b.to_owned(), a.to_owned()));
    }

    pub fn heal(&self, a: &str, b: &str) {
        let mut cut = self.cut.write();
        cut.remove(&(a.to_owned(), b.to_owned()));
        cut.remove(&(b.to_owned(), a.to_owned()));
    }

    /// Cuts `address` off from every registered service.
    pub fn isolate(&self, address: &str) {
        let others: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        for other in others.iter().filter(|o| o.as_str() != address) {
            self.partition(address, other);
        }
    }

    pub fn heal_all(&self) {
        self.cut.write().clear();
    }

    /// Artificial one-way delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RoundService>, RpcError> {
        if self.cut.read().contains(&(from.to_owned(), to.to_owned())) {
            return Err(RpcError::Unreachable(to.to_owned()));
        }
        self.services
            .get(to)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| RpcError::Unreachable(to.to_owned()))
    }

    async fn deliver(&self, from: &str, to: &str, request: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let service = self.route(from, to)?;
        let response = match decode::<RequestFrame>(&request)? {
            RequestFrame::RoundState(attestation) => service
                .handle_round_state(from, attestation)
                .map(ResponseFrame::RoundState),
            RequestFrame::Contribution(request) => service
                .handle_contribution(from, request)
                .map(ResponseFrame::Gossip),
            RequestFrame::Hash(request) => {
                service.handle_hash(from, request).map(ResponseFrame::Gossip)
            }
        }
        .unwrap_or_else(ResponseFrame::Error);

        trace!(from, to, bytes = request.len(), "frame delivered");
        encode(response)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One direction of an in-process link.
#[derive(Debug)]
pub struct MemoryClient {
    network: Arc<MemoryNetwork>,
    local: String,
    remote: String,
}

impl MemoryClient {
    async fn call(&self, frame: RequestFrame) -> Result<ResponseFrame, RpcError> {
        let request = encode(frame)?;
        let response = self
            .network
            .deliver(&self.local, &self.remote, request)
            .await?;
        decode(&response)
    }
}

#[async_trait]
impl PeerClient for MemoryClient {
    fn remote_address(&self) -> &str {
        &self.remote
    }

    async fn request_round_state(
        &self,
        attestation: RoundAttestation,
    ) -> Result<RoundAttestation, RpcError> {
        match self.call(RequestFrame::RoundState(attestation)).await? {
            ResponseFrame::RoundState(reply) => Ok(reply),
            ResponseFrame::Error(e) => Err(e),
            ResponseFrame::Gossip(_) => Err(RpcError::Codec("unexpected gossip reply".into())),
        }
    }

    async fn request_contribution(&self, request: GossipRequest) -> Result<GossipReply, RpcError> {
        gossip_reply(self.call(RequestFrame::Contribution(request)).await?)
    }

    async fn request_hash(&self, request: GossipRequest) -> Result<GossipReply, RpcError> {
        gossip_reply(self.call(RequestFrame::Hash(request)).await?)
    }
}

fn gossip_reply(frame: ResponseFrame) -> Result<GossipReply, RpcError> {
    match frame {
        ResponseFrame::Gossip(reply) => Ok(reply),
        ResponseFrame::Error(e) => Err(e),
        ResponseFrame::RoundState(_) => Err(RpcError::Codec("unexpected round state reply".into())),
    }
}
