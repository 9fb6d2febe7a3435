//! Deterministic block producer election.
//!
//! Every adjudicator that finalized the same round holds the same
//! address-sorted contribution set, so hashing it gives everyone the same
//! seed without another round trip.

use crate::crypto::hash::blake3_hash;

/// Picks the producer for the next block from a finalized contribution set.
///
/// The seed is BLAKE3 over `address || 0x00 || payload || 0x00` for each
/// entry in address order; its first eight bytes (little-endian) index the
/// sorted address list. Returns `None` for an empty set.
pub fn elect_producer(entries: &[(String, String)]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }

    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut seed_input = Vec::new();
    for (address, payload) in &sorted {
        seed_input.extend_from_slice(address.as_bytes());
        seed_input.push(0);
        seed_input.extend_from_slice(payload.as_bytes());
        seed_input.push(0);
    }
    let seed = blake3_hash(&seed_input);

    let mut index_bytes = [0u8; 8];
    index_bytes.copy_from_slice(&seed[..8]);
    let index = (u64::from_le_bytes(index_bytes) % sorted.len() as u64) as usize;

    Some(sorted[index].0.clone())
}
