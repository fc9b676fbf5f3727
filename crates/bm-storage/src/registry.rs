//! In-memory node registry.

use bm_core::{unix_now, NetworkAddress, NodeRegistry, NODE_NETWORK_SERVICE};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Addresses older than this many seconds are not handed out.
pub const ADDRESS_FRESHNESS: i64 = 3 * 60 * 60;

/// Upper bound on remembered addresses.
pub const MAX_KNOWN_ADDRESSES: usize = 20_000;

/// Addresses claiming a time further ahead than this are ignored.
const MAX_CLOCK_SKEW: i64 = 10 * 60;

/// Entries evicted at once when the registry is full and nothing is stale.
const EVICTION_BATCH: usize = MAX_KNOWN_ADDRESSES / 100;

/// Node registry backed by a concurrent map, with a static bootstrap list
/// used whenever no fresh addresses are known for a stream.
pub struct MemoryNodeRegistry {
    known: DashMap<SocketAddr, NetworkAddress>,
    bootstrap: RwLock<Vec<NetworkAddress>>,
}

impl MemoryNodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            known: DashMap::new(),
            bootstrap: RwLock::new(Vec::new()),
        }
    }

    /// Create a registry seeded with bootstrap peers for `stream`.
    pub fn with_bootstrap(peers: impl IntoIterator<Item = SocketAddr>, stream: u32) -> Self {
        let registry = Self::new();
        registry.add_bootstrap(peers, stream);
        registry
    }

    /// Add bootstrap peers.
    pub fn add_bootstrap(&self, peers: impl IntoIterator<Item = SocketAddr>, stream: u32) {
        let mut bootstrap = self.bootstrap.write();
        for addr in peers {
            let record = NetworkAddress::from_socket_addr(addr, stream, NODE_NETWORK_SERVICE, 0);
            if !bootstrap.iter().any(|b| b.same_endpoint(&record)) {
                bootstrap.push(record);
            }
        }
    }

    /// Number of learnt addresses.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no addresses were learnt.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Forget addresses that are no longer fresh. Returns how many were dropped.
    pub fn cleanup(&self, now: i64) -> usize {
        let oldest = now - ADDRESS_FRESHNESS;
        let before = self.known.len();
        self.known.retain(|_, a| a.time as i64 >= oldest);
        let removed = before.saturating_sub(self.known.len());
        if removed > 0 {
            debug!(removed, remaining = self.known.len(), "Forgot stale addresses");
        }
        removed
    }

    /// Make room for new addresses, dropping stale entries first and a
    /// batch of the oldest entries otherwise.
    fn make_room(&self, now: i64) {
        if self.cleanup(now) > 0 {
            return;
        }
        let mut entries: Vec<(u64, SocketAddr)> =
            self.known.iter().map(|r| (r.value().time, *r.key())).collect();
        let batch = EVICTION_BATCH.min(entries.len());
        if batch == 0 {
            return;
        }
        entries.select_nth_unstable_by_key(batch - 1, |(time, _)| *time);
        for (_, key) in &entries[..batch] {
            self.known.remove(key);
        }
        debug!(evicted = batch, "Registry full, evicted oldest addresses");
    }

    fn known_at(&self, now: i64, limit: usize, streams: &[u64]) -> Vec<NetworkAddress> {
        let oldest = now - ADDRESS_FRESHNESS;
        let mut fresh: Vec<NetworkAddress> = self
            .known
            .iter()
            .map(|r| *r.value())
            .filter(|a| streams.contains(&(a.stream as u64)))
            .filter(|a| a.time as i64 >= oldest)
            .collect();
        fresh.shuffle(&mut rand::thread_rng());
        fresh.truncate(limit);

        if fresh.len() < limit {
            let mut fallback: Vec<NetworkAddress> = self
                .bootstrap
                .read()
                .iter()
                .filter(|b| streams.contains(&(b.stream as u64)))
                .filter(|b| !fresh.iter().any(|f| f.same_endpoint(b)))
                .copied()
                .collect();
            fallback.shuffle(&mut rand::thread_rng());
            fallback.truncate(limit - fresh.len());
            fresh.extend(fallback);
        }

        fresh
    }

    fn offer_at(&self, now: i64, addresses: Vec<NetworkAddress>) {
        let mut accepted = 0usize;
        for address in addresses {
            let time = address.time as i64;
            if time > now + MAX_CLOCK_SKEW || time < now - ADDRESS_FRESHNESS {
                trace!(addr = %address, "Ignoring address with out-of-range time");
                continue;
            }
            let key = address.socket_addr();
            if let Some(mut existing) = self.known.get_mut(&key) {
                if existing.time < address.time {
                    *existing = address;
                }
                continue;
            }
            if self.known.len() >= MAX_KNOWN_ADDRESSES {
                self.make_room(now);
            }
            self.known.insert(key, address);
            accepted += 1;
        }
        if accepted > 0 {
            debug!(accepted, total = self.known.len(), "Learnt new addresses");
        }
    }
}

impl Default for MemoryNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry for MemoryNodeRegistry {
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetworkAddress> {
        self.known_at(unix_now(), limit, streams)
    }

    fn offer_addresses(&self, addresses: Vec<NetworkAddress>) {
        self.offer_at(unix_now(), addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn address(port: u16, stream: u32, time: i64) -> NetworkAddress {
        let addr: SocketAddr = format!("10.0.0.1:{port}").parse().unwrap();
        NetworkAddress::from_socket_addr(addr, stream, NODE_NETWORK_SERVICE, time as u64)
    }

    #[test]
    fn test_offer_and_query() {
        let registry = MemoryNodeRegistry::new();
        registry.offer_at(NOW, vec![address(1, 1, NOW), address(2, 1, NOW - 60), address(3, 2, NOW)]);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.known_at(NOW, 10, &[1]).len(), 2);
        assert_eq!(registry.known_at(NOW, 1, &[1, 2]).len(), 1);
    }

    #[test]
    fn test_rejects_stale_and_future_addresses() {
        let registry = MemoryNodeRegistry::new();
        registry.offer_at(
            NOW,
            vec![
                address(1, 1, NOW - ADDRESS_FRESHNESS - 1),
                address(2, 1, NOW + MAX_CLOCK_SKEW + 1),
            ],
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_newer_record_replaces_older() {
        let registry = MemoryNodeRegistry::new();
        registry.offer_at(NOW, vec![address(1, 1, NOW - 100)]);
        registry.offer_at(NOW, vec![address(1, 1, NOW - 10)]);
        registry.offer_at(NOW, vec![address(1, 1, NOW - 50)]);

        let known = registry.known_at(NOW, 10, &[1]);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].time as i64, NOW - 10);
    }

    fn fill(registry: &MemoryNodeRegistry, time: i64) {
        let batch = (0..MAX_KNOWN_ADDRESSES)
            .map(|i| {
                let addr = SocketAddr::from(([10, 1, (i >> 8) as u8, i as u8], 8444));
                NetworkAddress::from_socket_addr(addr, 1, NODE_NETWORK_SERVICE, time as u64)
            })
            .collect();
        registry.offer_at(time, batch);
        assert_eq!(registry.len(), MAX_KNOWN_ADDRESSES);
    }

    #[test]
    fn test_full_registry_learns_after_entries_go_stale() {
        let registry = MemoryNodeRegistry::new();
        fill(&registry, NOW);

        let later = NOW + 4 * 60 * 60;
        registry.offer_at(later, vec![address(1, 1, later)]);

        assert_eq!(registry.len(), 1);
        let known = registry.known_at(later, 10, &[1]);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].port, 1);
    }

    #[test]
    fn test_full_registry_replaces_oldest_entry() {
        let registry = MemoryNodeRegistry::new();
        fill(&registry, NOW - 60);
        let newest = address(2, 1, NOW);
        registry.offer_at(NOW, vec![address(1, 1, NOW - 30), newest]);

        assert_eq!(registry.len(), MAX_KNOWN_ADDRESSES - EVICTION_BATCH + 2);
        let known = registry.known_at(NOW, MAX_KNOWN_ADDRESSES, &[1]);
        assert!(known.iter().any(|a| a.port == 1));
        assert!(known.iter().any(|a| a.port == 2));
    }

    #[test]
    fn test_cleanup_forgets_stale_addresses() {
        let registry = MemoryNodeRegistry::new();
        registry.offer_at(NOW, vec![address(1, 1, NOW - 100), address(2, 1, NOW)]);

        assert_eq!(registry.cleanup(NOW + ADDRESS_FRESHNESS - 50), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.cleanup(NOW + ADDRESS_FRESHNESS - 50), 0);
    }

    #[test]
    fn test_bootstrap_fallback() {
        let peer: SocketAddr = "192.168.0.7:8444".parse().unwrap();
        let registry = MemoryNodeRegistry::with_bootstrap([peer, peer], 1);

        let known = registry.known_at(NOW, 5, &[1]);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].socket_addr(), peer);
        assert!(registry.known_at(NOW, 5, &[2]).is_empty());

        registry.offer_at(NOW, vec![address(1, 1, NOW)]);
        assert_eq!(registry.known_at(NOW, 1, &[1])[0].port, 1);
    }
}
