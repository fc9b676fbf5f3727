//! Inventory gossip helpers.
//!
//! - [`IvCache`]: which vectors a single peer is known to have
//! - [`RequestTracker`]: which vectors are currently requested, and from whom
//! - [`select_offer_targets`]: bounded random fan-out for new objects

use crate::PeerId;
use bm_core::{Inventory, InventoryVector};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a peer is assumed to still know a vector.
pub const IV_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum number of peers a new object is offered to.
pub const MAX_OFFER_FANOUT: usize = 8;

/// Per-connection knowledge cache, shared with the fan-out selection.
pub type SharedIvCache = Arc<Mutex<IvCache>>;

/// Vectors a peer announced or was sent, with the time they were seen.
///
/// Expired entries are purged lazily on lookup.
#[derive(Debug)]
pub struct IvCache {
    entries: HashMap<InventoryVector, Instant>,
    ttl: Duration,
}

impl IvCache {
    /// Cache with the default lifetime.
    pub fn new() -> Self {
        Self::with_ttl(IV_CACHE_TTL)
    }

    /// Cache with a custom lifetime.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Wrap a new cache for sharing.
    pub fn shared() -> SharedIvCache {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Record that the peer knows `iv`.
    pub fn insert(&mut self, iv: InventoryVector, now: Instant) {
        self.entries.insert(iv, now);
    }

    /// Record several vectors at once.
    pub fn extend<'a>(&mut self, ivs: impl IntoIterator<Item = &'a InventoryVector>, now: Instant) {
        for iv in ivs {
            self.entries.insert(*iv, now);
        }
    }

    /// Whether the peer is known to have `iv`.
    pub fn knows_of(&mut self, iv: &InventoryVector, now: Instant) -> bool {
        self.purge(now);
        self.entries.contains_key(iv)
    }

    /// Drop entries older than the lifetime.
    pub fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) <= ttl);
    }

    /// Number of cached entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for IvCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Node-wide record of requested vectors, so one object is only fetched
/// from one peer at a time.
#[derive(Debug, Default)]
pub struct RequestTracker {
    requested: DashMap<InventoryVector, PeerId>,
}

impl RequestTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the vectors nobody has requested yet for `peer`. Returns the
    /// claimed subset.
    pub fn claim(&self, peer: PeerId, ivs: &[InventoryVector]) -> Vec<InventoryVector> {
        ivs.iter()
            .filter(|iv| match self.requested.entry(**iv) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(peer);
                    true
                }
            })
            .copied()
            .collect()
    }

    /// Mark a vector as delivered. Returns whether it was outstanding.
    pub fn complete(&self, iv: &InventoryVector) -> bool {
        self.requested.remove(iv).is_some()
    }

    /// Release vectors claimed by `peer`.
    pub fn release(&self, peer: PeerId, ivs: &[InventoryVector]) {
        for iv in ivs {
            self.requested.remove_if(iv, |_, owner| *owner == peer);
        }
    }

    /// Whether someone requested `iv`.
    pub fn is_requested(&self, iv: &InventoryVector) -> bool {
        self.requested.contains_key(iv)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requested.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.requested.is_empty()
    }
}

/// Vectors of `offered` that should be requested from `peer`: not stored
/// locally for `streams`, and not already requested from anyone. The
/// returned vectors are claimed for `peer`.
pub fn missing_vectors(
    inventory: &dyn Inventory,
    tracker: &RequestTracker,
    peer: PeerId,
    offered: &[InventoryVector],
    streams: &[u64],
) -> Vec<InventoryVector> {
    let missing = inventory.get_missing(offered, streams);
    tracker.claim(peer, &missing)
}

/// Pick up to `limit` random candidates for which `knows` is false.
pub fn select_offer_targets<T>(
    candidates: Vec<T>,
    mut knows: impl FnMut(&T) -> bool,
    limit: usize,
) -> Vec<T> {
    let mut unaware: Vec<T> = candidates.into_iter().filter(|c| !knows(c)).collect();
    unaware.shuffle(&mut rand::thread_rng());
    unaware.truncate(limit);
    unaware
}
