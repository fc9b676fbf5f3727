//! Storage ports consumed by the protocol engine.
//!
//! Both traits are shared by every connection task at once, so
//! implementations must tolerate concurrent reads and inserts, including
//! inserts that race with an iteration over the same streams.

use crate::{InventoryVector, NetworkAddress, ObjectEnvelope};

/// The local object pool.
pub trait Inventory: Send + Sync + 'static {
    /// Whether the object is stored.
    fn contains(&self, iv: &InventoryVector) -> bool;

    /// Store an object. Returns `false` if it was already present, in which
    /// case nothing changes.
    fn store(&self, iv: InventoryVector, object: ObjectEnvelope) -> bool;

    /// Fetch a stored object.
    fn get(&self, iv: &InventoryVector) -> Option<ObjectEnvelope>;

    /// The subset of `offer` not stored for any of `streams`.
    fn get_missing(&self, offer: &[InventoryVector], streams: &[u64]) -> Vec<InventoryVector>;

    /// Every stored vector in `streams`.
    fn inventory(&self, streams: &[u64]) -> Vec<InventoryVector>;

    /// Stored objects of `stream`, optionally filtered by version and types.
    /// An empty `types` slice matches every type.
    fn list_by_stream_and_type(
        &self,
        stream: u64,
        version: Option<u64>,
        types: &[u32],
    ) -> Vec<ObjectEnvelope>;

    /// Drop objects that expired before `now` minus the retention grace.
    /// Returns the number of removed objects.
    fn cleanup(&self, now: i64) -> usize;
}

/// Registry of known peer addresses.
pub trait NodeRegistry: Send + Sync + 'static {
    /// Up to `limit` recently seen addresses serving any of `streams`.
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetworkAddress>;

    /// Record addresses learnt from peers.
    fn offer_addresses(&self, addresses: Vec<NetworkAddress>);
}
