//! # Round Caches
//!
//! Two of these exist per process: one for contributions, one for hash
//! commitments. Each maps a [`RoundKey`] to the per-address entries known for
//! that round.
//!
//! ## Concurrency
//!
//! The outer and inner maps are both `DashMap`s, so gossip tasks, RPC
//! handlers and the pruner all hit the cache concurrently without a coarse
//! lock. Lock order is always outer shard, then inner shard. Readers clone
//! the inner `Arc` and release the outer shard before touching entries.
//!
//! ## Bounds
//!
//! - Keys whose entry map is empty are evicted eagerly.
//! - Beyond `capacity` keys, the oldest keys by `(height, phase)` go first,
//!   except keys in the admission window of the last active key we were
//!   told about. Those are never evicted by the cap.
//! - [`RoundCache::sweep_behind_window`] drops everything strictly older than
//!   the retention window of the active key.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::ROUND_CACHE_CAPACITY;
use crate::consensus::round::{EntryKind, RoundKey, SignedEntry};

type EntryMap = Arc<DashMap<String, SignedEntry>>;

/// A bounded, concurrent map from round key to per-address signed entries.
#[derive(Debug)]
pub struct RoundCache {
    kind: EntryKind,
    capacity: usize,
    rounds: DashMap<RoundKey, EntryMap>,
    active: RwLock<Option<RoundKey>>,
}

impl RoundCache {
    pub fn new(kind: EntryKind) -> Self {
        Self::with_capacity(kind, ROUND_CACHE_CAPACITY)
    }

    pub fn with_capacity(kind: EntryKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            rounds: DashMap::new(),
            active: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records the key currently being negotiated. Its admission window is
    /// exempt from the capacity cap.
    pub fn set_active(&self, active: RoundKey) {
        *self.active.write() = Some(active);
    }

    /// Adds `entry` for `address` under `key` unless one is already present.
    ///
    /// Returns `true` if the entry was inserted. The first verified value for
    /// an address wins; later copies are ignored.
    pub fn insert_if_absent(&self, key: RoundKey, address: &str, entry: SignedEntry) -> bool {
        let inserted = {
            let slot = self.rounds.entry(key).or_default();
            let inserted = match slot.entry(address.to_owned()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(vacant) => {
                    vacant.insert(entry);
                    true
                }
            };
            inserted
        };

        if inserted {
            trace!(kind = self.kind.label(), %key, address, "entry cached");
            if self.rounds.len() > self.capacity {
                self.enforce_capacity();
            }
        }
        inserted
    }

    fn slot(&self, key: RoundKey) -> Option<EntryMap> {
        self.rounds.get(&key).map(|slot| Arc::clone(slot.value()))
    }

    pub fn get(&self, key: RoundKey, address: &str) -> Option<SignedEntry> {
        self.slot(key)?.get(address).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: RoundKey, address: &str) -> bool {
        self.slot(key)
            .map(|slot| slot.contains_key(address))
            .unwrap_or(false)
    }

    /// Number of entries held for `key`.
    pub fn count(&self, key: RoundKey) -> usize {
        self.slot(key).map(|slot| slot.len()).unwrap_or(0)
    }

    /// Address-sorted copy of every entry under `key`.
    pub fn entries(&self, key: RoundKey) -> BTreeMap<String, SignedEntry> {
        self.slot(key)
            .map(|slot| {
                slot.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The set of addresses that have an entry under `key`.
    pub fn addresses(&self, key: RoundKey) -> HashSet<String> {
        self.slot(key)
            .map(|slot| slot.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    /// The first address of `candidates` that has an entry under `key`.
    pub fn first_present(
        &self,
        key: RoundKey,
        candidates: &[String],
    ) -> Option<(String, SignedEntry)> {
        let slot = self.slot(key)?;
        candidates.iter().find_map(|address| {
            slot.get(address)
                .map(|entry| (address.clone(), entry.value().clone()))
        })
    }

    /// All cached round keys, oldest first.
    pub fn keys(&self) -> Vec<RoundKey> {
        let mut keys: Vec<RoundKey> = self.rounds.iter().map(|r| *r.key()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn key_count(&self) -> usize {
        self.rounds.len()
    }

    /// Round keys that currently hold an entry from `address`.
    pub fn keys_containing(&self, address: &str) -> Vec<RoundKey> {
        let mut keys: Vec<RoundKey> = self
            .rounds
            .iter()
            .filter(|r| r.value().contains_key(address))
            .map(|r| *r.key())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Removes `address`'s entry from `key`, dropping the key if it empties.
    pub fn remove_entry(&self, key: RoundKey, address: &str) -> bool {
        let removed = self
            .slot(key)
            .map(|slot| slot.remove(address).is_some())
            .unwrap_or(false);
        if removed {
            self.rounds.remove_if(&key, |_, slot| slot.is_empty());
        }
        removed
    }

    /// Drops every key strictly behind the retention window of `active`.
    /// Returns how many keys were removed.
    pub fn sweep_behind_window(&self, active: RoundKey) -> usize {
        self.set_active(active);
        let before = self.rounds.len();
        self.rounds.retain(|key, _| !key.is_behind_window(active));
        let removed = before.saturating_sub(self.rounds.len());
        if removed > 0 {
            debug!(kind = self.kind.label(), %active, removed, "swept rounds behind window");
        }
        removed
    }

    /// Evicts empty keys, then the oldest keys beyond `capacity` that lie
    /// outside the active admission window.
    pub fn enforce_capacity(&self) -> usize {
        let before = self.rounds.len();
        self.rounds.retain(|_, slot| !slot.is_empty());

        let excess = self.rounds.len().saturating_sub(self.capacity);
        if excess > 0 {
            let active = *self.active.read();
            let protected = |key: &RoundKey| active.is_some_and(|a| key.in_admission_window(a));
            for key in self
                .keys()
                .into_iter()
                .filter(|key| !protected(key))
                .take(excess)
            {
                self.rounds.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.rounds.len());
        if removed > 0 {
            debug!(kind = self.kind.label(), removed, "evicted round keys");
        }
        removed
    }

    /// Number of entries per key, oldest key first. For diagnostics.
    pub fn summary(&self) -> Vec<(RoundKey, usize)> {
        self.keys()
            .into_iter()
            .map(|key| (key, self.count(key)))
            .collect()
    }
}
