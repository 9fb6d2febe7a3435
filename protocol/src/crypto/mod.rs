//! # Cryptographic Primitives for ARBITER
//!
//! Everything security-related in the round protocol flows through here:
//! adjudicator keys, the canonical round-set digest, and the exact bytes each
//! signed message covers.
//!
//! We don't roll our own crypto. Everything here is a thin, type-safe wrapper
//! around `ed25519-dalek`, `sha2` and `blake3`.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{blake3_hash, canonical_digest, entry_digest, sha256};
pub use keys::{verify_hex, ArbiterKeypair, KeyError};
pub use signatures::{
    attestation_message, contribution_message, hash_message, Ed25519Verifier, SignatureVerifier,
};
