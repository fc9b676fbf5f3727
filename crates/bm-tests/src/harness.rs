//! Test harness for running nodes in-process.
//!
//! Every [`TestNode`] listens on an ephemeral localhost port with cheap
//! proof-of-work and no automatic dialing, so scenarios decide the topology.

use bm_core::{Inventory, InventoryVector, NodeRegistry, ObjectEnvelope, Sha512Cryptography};
use bm_network::{CustomCommandHandler, NetworkConfig, NetworkService, NetworkStatus};
use bm_pow::{CancelHandle, PowParams, ProofOfWorkEngine};
use bm_storage::{MemoryInventory, MemoryNodeRegistry};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default time a scenario waits for the network to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Proof-of-work engine with trivial difficulty.
pub fn cheap_pow() -> Arc<ProofOfWorkEngine> {
    Arc::new(ProofOfWorkEngine::new(
        Arc::new(Sha512Cryptography),
        PowParams::with_floors(1, 1, 1, 1),
        Some(1),
    ))
}

/// Network settings for a localhost test node.
pub fn test_network_config() -> NetworkConfig {
    NetworkConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        target_outbound: 0,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(100),
        idle_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(3600),
        ..NetworkConfig::default()
    }
}

/// A running node with direct access to its storage.
pub struct TestNode {
    /// The P2P service.
    pub service: NetworkService,
    /// Object inventory.
    pub inventory: Arc<MemoryInventory>,
    /// Known addresses.
    pub registry: Arc<MemoryNodeRegistry>,
    /// Proof-of-work engine.
    pub pow: Arc<ProofOfWorkEngine>,
    /// Bound listen address.
    pub addr: SocketAddr,
}

impl TestNode {
    /// Start a node with the default test settings.
    pub async fn start() -> Self {
        Self::start_with(test_network_config(), None).await
    }

    /// Start a node answering custom requests with `handler`.
    pub async fn start_with_handler(handler: Arc<dyn CustomCommandHandler>) -> Self {
        Self::start_with(test_network_config(), Some(handler)).await
    }

    /// Start a node with explicit settings.
    pub async fn start_with(
        config: NetworkConfig,
        handler: Option<Arc<dyn CustomCommandHandler>>,
    ) -> Self {
        let inventory = Arc::new(MemoryInventory::new());
        let registry = Arc::new(MemoryNodeRegistry::new());
        let pow = cheap_pow();
        let service = NetworkService::new(
            config,
            Arc::clone(&inventory) as Arc<dyn Inventory>,
            Arc::clone(&registry) as Arc<dyn NodeRegistry>,
            Arc::clone(&pow),
            handler,
        );
        let addr = service.start().await.expect("test node should bind");

        Self {
            service,
            inventory,
            registry,
            pow,
            addr,
        }
    }

    /// Solve proof-of-work for `object`.
    pub fn mine(&self, object: ObjectEnvelope) -> ObjectEnvelope {
        self.pow
            .do_work(object, &CancelHandle::new())
            .expect("cheap proof-of-work should succeed")
    }

    /// Mine `object` and publish it.
    pub fn publish(&self, object: ObjectEnvelope) -> InventoryVector {
        let mined = self.mine(object);
        self.service.publish(mined).expect("publish should succeed")
    }

    /// Whether the inventory holds `iv`.
    pub fn has(&self, iv: &InventoryVector) -> bool {
        self.inventory.contains(iv)
    }

    /// Current network status.
    pub fn status(&self) -> NetworkStatus {
        self.service.status()
    }

    /// Number of connections past the handshake.
    pub fn active_connections(&self) -> usize {
        self.service.status().connections.active
    }

    /// Wait until the object arrives, panicking otherwise.
    pub async fn assert_receives(&self, iv: InventoryVector) {
        let arrived = wait_until(SETTLE_TIMEOUT, || self.has(&iv)).await;
        assert!(arrived, "object {} never reached {}", iv, self.addr);
    }

    /// Stop the node.
    pub async fn stop(self) {
        self.service.stop().await;
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run `future` with the settle timeout, panicking if it does not finish.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(SETTLE_TIMEOUT, future)
        .await
        .expect("operation did not finish in time")
}

/// Connect `from` to `to` and wait until both sides are active.
pub async fn link(from: &TestNode, to: &TestNode) {
    let before_from = from.active_connections();
    let before_to = to.active_connections();
    from.service.connect(to.addr);
    let linked = wait_until(SETTLE_TIMEOUT, || {
        from.active_connections() > before_from && to.active_connections() > before_to
    })
    .await;
    assert!(linked, "handshake between {} and {} did not complete", from.addr, to.addr);
}
