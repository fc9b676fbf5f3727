//! In-memory object inventory.

use bm_core::{Inventory, InventoryVector, ObjectEnvelope};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Seconds an object is retained after it expires.
pub const INVENTORY_RETENTION_GRACE: i64 = 5 * 60;

/// Object pool backed by a concurrent map.
///
/// Iteration never blocks inserts from other tasks; a flood that races with
/// a store simply may or may not include the new vector.
pub struct MemoryInventory {
    objects: DashMap<InventoryVector, ObjectEnvelope>,
    retention_grace: i64,
}

impl MemoryInventory {
    /// Create an empty inventory.
    pub fn new() -> Self {
        Self::with_retention_grace(INVENTORY_RETENTION_GRACE)
    }

    /// Create an inventory keeping expired objects for `grace` seconds.
    pub fn with_retention_grace(grace: i64) -> Self {
        Self {
            objects: DashMap::new(),
            retention_grace: grace,
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory for MemoryInventory {
    fn contains(&self, iv: &InventoryVector) -> bool {
        self.objects.contains_key(iv)
    }

    fn store(&self, iv: InventoryVector, object: ObjectEnvelope) -> bool {
        match self.objects.entry(iv) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(object);
                true
            }
        }
    }

    fn get(&self, iv: &InventoryVector) -> Option<ObjectEnvelope> {
        self.objects.get(iv).map(|r| r.value().clone())
    }

    fn get_missing(&self, offer: &[InventoryVector], streams: &[u64]) -> Vec<InventoryVector> {
        let mut seen = HashSet::with_capacity(offer.len());
        offer
            .iter()
            .filter(|iv| seen.insert(**iv))
            .filter(|iv| match self.objects.get(*iv) {
                Some(object) => !streams.contains(&object.stream()),
                None => true,
            })
            .copied()
            .collect()
    }

    fn inventory(&self, streams: &[u64]) -> Vec<InventoryVector> {
        self.objects
            .iter()
            .filter(|r| streams.contains(&r.value().stream()))
            .map(|r| *r.key())
            .collect()
    }

    fn list_by_stream_and_type(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[u32],
    ) -> Vec<ObjectEnvelope> {
        self.objects
            .iter()
            .map(|r| r.value().clone())
            .filter(|o| o.stream() == stream)
            .filter(|o| version.map_or(true, |v| o.version() == v))
            .filter(|o| types.is_empty() || types.contains(&o.object_type()))
            .collect()
    }

    fn cleanup(&self, now: i64) -> usize {
        let cutoff = now - self.retention_grace;
        let before = self.objects.len();
        self.objects.retain(|_, object| object.expires_time() >= cutoff);
        let removed = before.saturating_sub(self.objects.len());
        if removed > 0 {
            debug!(removed, "Removed expired objects");
        }
        removed
    }
}
