//! Peer bookkeeping shared between connection tasks, the pool manager and
//! the service API.

use crate::connection::{ConnectionMode, DisconnectReason, Lifecycle};
use crate::gossip::SharedIvCache;
use bm_core::InventoryVector;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Commands delivered to a connection task.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    /// Announce a newly stored object.
    Offer(InventoryVector),
    /// Request vectors released by a dead connection, if this peer has them.
    Reassign(Vec<InventoryVector>),
    /// Close the connection.
    Disconnect(DisconnectReason),
}

/// Peer information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Connection identifier.
    pub id: PeerId,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Connection mode.
    pub mode: ConnectionMode,
    /// Lifecycle state.
    pub state: Lifecycle,
    /// Negotiated protocol version.
    pub version: Option<i32>,
    /// Peer user agent.
    pub user_agent: Option<String>,
    /// Streams shared with the peer.
    pub streams: Vec<u64>,
    /// When the connection was established.
    pub connected_at: Instant,
}

impl PeerInfo {
    /// Create info for a new connection.
    pub fn new(id: PeerId, addr: SocketAddr, mode: ConnectionMode) -> Self {
        Self {
            id,
            addr,
            mode,
            state: Lifecycle::Connecting,
            version: None,
            user_agent: None,
            streams: Vec::new(),
            connected_at: Instant::now(),
        }
    }

    /// Whether the peer was dialed by this node.
    pub fn outbound(&self) -> bool {
        self.mode != ConnectionMode::Server
    }
}

/// Handle to a peer connection task.
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerCommand>,
    info: Arc<RwLock<PeerInfo>>,
    iv_cache: SharedIvCache,
}

impl PeerHandle {
    /// Create a handle.
    pub fn new(tx: mpsc::Sender<PeerCommand>, info: PeerInfo, iv_cache: SharedIvCache) -> Self {
        Self {
            tx,
            info: Arc::new(RwLock::new(info)),
            iv_cache,
        }
    }

    /// Snapshot of the peer info.
    pub fn info(&self) -> PeerInfo {
        self.info.read().clone()
    }

    /// Update the peer info in place.
    pub fn update(&self, f: impl FnOnce(&mut PeerInfo)) {
        f(&mut *self.info.write());
    }

    /// Knowledge cache of the connection.
    pub fn iv_cache(&self) -> &SharedIvCache {
        &self.iv_cache
    }

    /// Whether the connection finished its handshake.
    pub fn is_active(&self) -> bool {
        self.info.read().state == Lifecycle::Active
    }

    /// Queue a command without waiting. Returns whether it was queued.
    pub fn try_send(&self, command: PeerCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                trace!(peer = %self.info.read().id, error = %e, "Dropping peer command");
                false
            }
        }
    }
}

/// Connection counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// Handshaking connections.
    pub connecting: usize,
    /// Connections past the handshake.
    pub active: usize,
}

/// Every live connection.
#[derive(Default)]
pub struct PeerTable {
    peers: DashMap<PeerId, PeerHandle>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn insert(&self, handle: PeerHandle) {
        let id = handle.info.read().id;
        self.peers.insert(id, handle);
        debug!(peer = %id, total = self.peers.len(), "Peer registered");
    }

    /// Remove a connection.
    pub fn remove(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers.remove(id).map(|(_, handle)| handle)
    }

    /// Look up a connection.
    pub fn get(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers.get(id).map(|r| r.clone())
    }

    /// Handles of every connection.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers.iter().map(|r| r.value().clone()).collect()
    }

    /// Handles of active connections, excluding `except`.
    pub fn active_handles(&self, except: Option<PeerId>) -> Vec<PeerHandle> {
        self.peers
            .iter()
            .filter(|r| Some(*r.key()) != except && r.value().is_active())
            .map(|r| r.value().clone())
            .collect()
    }

    /// Handles of active connections sharing `stream`, excluding `except`.
    pub fn active_handles_in_stream(&self, stream: u64, except: Option<PeerId>) -> Vec<PeerHandle> {
        self.active_handles(except)
            .into_iter()
            .filter(|handle| handle.info.read().streams.contains(&stream))
            .collect()
    }

    /// Snapshot of every connection.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|r| r.value().info()).collect()
    }

    /// Whether a connection to `addr` exists.
    pub fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.peers.iter().any(|r| r.value().info.read().addr == *addr)
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are no connections.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Counts per state.
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for handle in self.peers.iter() {
            match handle.value().info.read().state {
                Lifecycle::Connecting => counts.connecting += 1,
                Lifecycle::Active => counts.active += 1,
                Lifecycle::Disconnected => {}
            }
        }
        counts
    }

    /// Counts per stream and state. Connections still handshaking have no
    /// streams yet and are not included.
    pub fn counts_by_stream(&self) -> BTreeMap<u64, StateCounts> {
        let mut by_stream: BTreeMap<u64, StateCounts> = BTreeMap::new();
        for handle in self.peers.iter() {
            let info = handle.value().info.read();
            for stream in &info.streams {
                let counts = by_stream.entry(*stream).or_default();
                match info.state {
                    Lifecycle::Connecting => counts.connecting += 1,
                    Lifecycle::Active => counts.active += 1,
                    Lifecycle::Disconnected => {}
                }
            }
        }
        by_stream
    }
}
