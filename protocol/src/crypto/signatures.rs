//! # Signing Messages & Verification
//!
//! Every tuple that crosses the wire in the round protocol is authenticated:
//! contributions, hash commitments and heartbeat attestations. This module
//! defines the exact bytes that get signed for each of them, and the
//! [`SignatureVerifier`] seam the rest of the crate verifies through.
//!
//! ## Domain separation
//!
//! Each message starts with its own domain tag (see `config`). Without it, a
//! peer could take a signed contribution whose payload happens to look like
//! a digest and replay it as a hash commitment. With it, that signature
//! simply doesn't verify.

use crate::config::{ATTESTATION_DOMAIN, CONTRIBUTION_DOMAIN, HASH_DOMAIN};
use crate::consensus::round::RoundKey;
use crate::crypto::keys::verify_hex;

/// Verification of a signature against a claimed adjudicator address.
///
/// Implemented by the identity layer. The default [`Ed25519Verifier`] treats
/// the address as a hex-encoded Ed25519 public key.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` iff `signature` is a valid signature of `message`
    /// by the key behind `address`.
    fn verify(&self, address: &str, message: &[u8], signature: &str) -> bool;
}

/// Verifies Ed25519 signatures where the address is the hex public key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, address: &str, message: &[u8], signature: &str) -> bool {
        verify_hex(address, message, signature)
    }
}

/// Bytes signed for a contribution payload.
///
/// The payload is opaque and carries its own height context, so the round
/// key is not mixed in. That lets a round that restarts at a new height
/// republish the same signed payload.
pub fn contribution_message(payload: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(CONTRIBUTION_DOMAIN.len() + payload.len());
    message.extend_from_slice(CONTRIBUTION_DOMAIN);
    message.extend_from_slice(payload.as_bytes());
    message
}

/// Bytes signed for a round-set digest. Bound to the round key so a digest
/// signed for one phase can't be counted in another.
pub fn hash_message(key: RoundKey, digest: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(HASH_DOMAIN.len() + 12 + digest.len());
    message.extend_from_slice(HASH_DOMAIN);
    message.extend_from_slice(&key.height.to_le_bytes());
    message.extend_from_slice(&key.phase.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message
}

/// Bytes signed for a heartbeat attestation.
pub fn attestation_message(
    address: &str,
    height: u64,
    phase: u32,
    finalized: bool,
    timestamp_ms: i64,
    nonce: u64,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(ATTESTATION_DOMAIN.len() + address.len() + 29);
    message.extend_from_slice(ATTESTATION_DOMAIN);
    message.extend_from_slice(address.as_bytes());
    message.extend_from_slice(&height.to_le_bytes());
    message.extend_from_slice(&phase.to_le_bytes());
    message.push(u8::from(finalized));
    message.extend_from_slice(&timestamp_ms.to_le_bytes());
    message.extend_from_slice(&nonce.to_le_bytes());
    message
}
