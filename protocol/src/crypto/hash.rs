//! # Hashing Utilities
//!
//! Hash functions used by the round protocol:
//!
//! - **SHA-256** for the round-set fingerprint. Every adjudicator must derive
//!   the same hex string from the same contribution set, so this is the one
//!   place where we pick the boring, universally-implemented option.
//! - **BLAKE3** for values each node derives locally and never sends
//!   (block producer election seeds).
//!
//! ## Canonical digest
//!
//! Contributions arrive in gossip order, which differs per node. The
//! fingerprint is therefore computed over per-entry digests **sorted by
//! address** and concatenated, then hashed once more. Two nodes holding the
//! same set always produce byte-identical digests regardless of merge order.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex digest of a single `(address, payload)` contribution.
///
/// The address is length-prefixed so `("ab", "c")` and `("a", "bc")` never
/// collide.
pub fn entry_digest(address: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((address.len() as u64).to_le_bytes());
    hasher.update(address.as_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Order-independent fingerprint of a contribution set.
///
/// Sorts by address, concatenates the per-entry digests and hashes the
/// result. An empty set hashes the empty string.
pub fn canonical_digest<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: Vec<(&str, &str)> = entries.into_iter().collect();
    sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut concatenated = String::with_capacity(sorted.len() * 64);
    for (address, payload) in sorted {
        concatenated.push_str(&entry_digest(address, payload));
    }
    hex::encode(sha256(concatenated.as_bytes()))
}
