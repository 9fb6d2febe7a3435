//! Adjudicator membership and majority math.
//!
//! The authorized signing set is owned by an external authority and may
//! change between (or even during) rounds. Nothing here caches it: callers
//! ask again every time they need a quorum size.

use parking_lot::RwLock;

/// Source of the currently authorized signing addresses.
pub trait MembershipAuthority: Send + Sync {
    /// The ordered set of authorized adjudicator addresses.
    fn signing_addresses(&self) -> Vec<String>;

    fn is_member(&self, address: &str) -> bool {
        self.signing_addresses().iter().any(|a| a == address)
    }
}

/// Majority threshold for `n` members: `floor(n / 2) + 1`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// A membership list held in memory, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticMembership {
    addresses: RwLock<Vec<String>>,
}

impl StaticMembership {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let membership = Self::default();
        membership.replace(addresses);
        membership
    }

    /// Swaps in a new membership list. Sorted and de-duplicated.
    pub fn replace<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list: Vec<String> = addresses.into_iter().map(Into::into).collect();
        list.sort();
        list.dedup();
        *self.addresses.write() = list;
    }

    pub fn len(&self) -> usize {
        self.addresses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.read().is_empty()
    }
}

impl MembershipAuthority for StaticMembership {
    fn signing_addresses(&self) -> Vec<String> {
        self.addresses.read().clone()
    }

    fn is_member(&self, address: &str) -> bool {
        self.addresses
            .read()
            .binary_search_by(|a| a.as_str().cmp(address))
            .is_ok()
    }
}
