//! Node implementation.

use crate::config::NodeConfig;
use anyhow::Result;
use bm_core::{unix_now, Inventory, NodeRegistry, Sha512Cryptography};
use bm_network::NetworkService;
use bm_pow::ProofOfWorkEngine;
use bm_storage::{parse_peer_address, BootstrapDiscovery, MemoryInventory, MemoryNodeRegistry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The main node struct coordinating all components.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,
    /// Object inventory.
    inventory: Arc<MemoryInventory>,
    /// Known peer addresses.
    registry: Arc<MemoryNodeRegistry>,
    /// P2P service.
    network: NetworkService,
    /// Shutdown flag.
    shutdown: Arc<AtomicBool>,
    /// Wakes the run loop on shutdown.
    shutdown_notify: Arc<Notify>,
}

impl Node {
    /// Create a new node.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let inventory = Arc::new(MemoryInventory::new());

        let stream = config.network.streams.first().copied().unwrap_or(1) as u32;
        let registry = Arc::new(MemoryNodeRegistry::new());
        let known: Vec<SocketAddr> = config
            .network
            .known_peers
            .iter()
            .filter_map(|peer| {
                let addr = parse_peer_address(peer);
                if addr.is_none() {
                    warn!(peer = %peer, "Ignoring unresolvable known peer");
                }
                addr
            })
            .collect();
        registry.add_bootstrap(known, stream);

        if config.network.dns_bootstrap {
            let discovered = BootstrapDiscovery::new().discover().await;
            info!(count = discovered.len(), "Bootstrap peers discovered");
            registry.add_bootstrap(discovered, stream);
        }

        let pow = Arc::new(ProofOfWorkEngine::new(
            Arc::new(Sha512Cryptography),
            config.pow_params(),
            config.pow_threads(),
        ));
        info!(
            nonce_trials_per_byte = pow.params().nonce_trials_per_byte(),
            extra_bytes = pow.params().extra_bytes(),
            "Proof-of-work engine ready"
        );

        let network = NetworkService::new(
            config.network_config()?,
            Arc::clone(&inventory) as Arc<dyn Inventory>,
            Arc::clone(&registry) as Arc<dyn NodeRegistry>,
            pow,
            None,
        );

        Ok(Arc::new(Self {
            config,
            inventory,
            registry,
            network,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }))
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Run the node until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let addr = self.network.start().await?;
        info!(addr = %addr, "Node running");

        for peer in &self.config.network.connect {
            match parse_peer_address(peer) {
                Some(addr) => self.network.connect(addr),
                None => warn!(peer = %peer, "Cannot resolve peer"),
            }
        }

        let mut cleanup_interval = tokio::time::interval(Duration::from_secs(
            self.config.inventory.cleanup_interval_secs,
        ));
        cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cleanup_interval.tick() => self.tick(),
                _ = self.shutdown_notify.notified() => {}
            }
        }

        Ok(())
    }

    /// Housekeeping: drop expired objects and stale addresses, and log the pool state.
    fn tick(&self) {
        let removed = self.inventory.cleanup(unix_now());
        if removed > 0 {
            info!(removed, remaining = self.inventory.len(), "Removed expired objects");
        }
        self.registry.cleanup(unix_now());

        let status = self.network.status();
        debug!(
            active = status.connections.active,
            connecting = status.connections.connecting,
            outstanding = status.outstanding_requests,
            known_addresses = self.registry.len(),
            objects = self.inventory.len(),
            "Node status"
        );
    }

    /// Synchronize once with a trusted host.
    pub async fn synchronize(&self, addr: SocketAddr, timeout: Duration) -> Result<usize> {
        Ok(self.network.synchronize(addr, timeout).await?)
    }

    /// Shutdown the node.
    pub async fn shutdown(&self) {
        info!("Shutting down node");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
        self.network.stop().await;
        info!("Node shutdown complete");
    }
}
