//! Bootstrap peer discovery.
//!
//! Resolves the well-known bootstrap host names into socket addresses that
//! seed the node registry on start-up.

use bm_core::DEFAULT_PORT;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bootstrap host names.
pub const BOOTSTRAP_DNS_SEEDS: &[&str] = &[
    "bootstrap8444.bitmessage.org:8444",
    "bootstrap8080.bitmessage.org:8080",
];

/// DNS based bootstrap discovery.
pub struct BootstrapDiscovery {
    seeds: Vec<String>,
    dns_timeout: Duration,
}

impl BootstrapDiscovery {
    /// Discovery over the default seeds.
    pub fn new() -> Self {
        Self::with_seeds(BOOTSTRAP_DNS_SEEDS.iter().map(|s| s.to_string()).collect())
    }

    /// Discovery over custom seeds.
    pub fn with_seeds(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Set DNS resolution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    /// Resolve every seed, skipping the ones that fail.
    pub async fn discover(&self) -> Vec<SocketAddr> {
        let mut peers = Vec::new();

        for seed in &self.seeds {
            match self.resolve_seed(seed).await {
                Ok(addrs) => {
                    info!(seed = %seed, count = addrs.len(), "Resolved bootstrap seed");
                    peers.extend(addrs);
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to resolve bootstrap seed");
                }
            }
        }

        peers.sort();
        peers.dedup();
        debug!(count = peers.len(), "Bootstrap discovery finished");
        peers
    }

    async fn resolve_seed(&self, seed: &str) -> Result<Vec<SocketAddr>, std::io::Error> {
        let seed = seed.to_string();

        let result = timeout(
            self.dns_timeout,
            tokio::task::spawn_blocking(move || {
                seed.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            }),
        )
        .await;

        match result {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Task join error: {}", e),
            )),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "DNS resolution timed out",
            )),
        }
    }
}

impl Default for BootstrapDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `host[:port]`, falling back to the default port and then to DNS.
pub fn parse_peer_address(addr: &str) -> Option<SocketAddr> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        return Some(socket_addr);
    }

    if !addr.contains(':') {
        if let Ok(socket_addr) = format!("{}:{}", addr, DEFAULT_PORT).parse::<SocketAddr>() {
            return Some(socket_addr);
        }
        return (addr, DEFAULT_PORT).to_socket_addrs().ok()?.next();
    }

    addr.to_socket_addrs().ok()?.next()
}
