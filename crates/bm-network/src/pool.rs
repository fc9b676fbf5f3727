//! Connection pool policy.
//!
//! The sweep is a pure function of the current peer table so it can be
//! tested without sockets; the service applies the resulting plan.

use crate::connection::{ConnectionMode, DisconnectReason, Lifecycle};
use crate::peer::{PeerId, PeerInfo};
use crate::NetworkConfig;
use bm_core::NodeRegistry;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    pub connection_limit: usize,
    /// Age after which a connection is rotated out.
    pub connection_ttl: Duration,
    /// Dial new peers while fewer connections than this exist.
    pub target_outbound: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_limit: 150,
            connection_ttl: Duration::from_secs(30 * 60),
            target_outbound: 8,
        }
    }
}

impl From<&NetworkConfig> for PoolConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            connection_limit: config.connection_limit,
            connection_ttl: config.connection_ttl,
            target_outbound: config.target_outbound,
        }
    }
}

/// What one sweep decided.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    /// Connections to close.
    pub disconnect: Vec<(PeerId, DisconnectReason)>,
    /// Addresses to dial.
    pub connect: Vec<SocketAddr>,
}

impl PoolPlan {
    /// Whether nothing has to be done.
    pub fn is_empty(&self) -> bool {
        self.disconnect.is_empty() && self.connect.is_empty()
    }
}

/// Decide which connections to drop and which peers to dial.
///
/// - Above the limit, the oldest connections go first.
/// - At most one connection older than the TTL is rotated per sweep.
/// - Below the outbound target, fresh addresses from the registry are
///   dialed, skipping endpoints already connected.
///
/// Sync connections are left alone: they end on their own.
pub fn plan(
    config: &PoolConfig,
    peers: &[PeerInfo],
    registry: &dyn NodeRegistry,
    streams: &[u64],
    now: Instant,
) -> PoolPlan {
    let mut plan = PoolPlan::default();

    let mut live: Vec<&PeerInfo> = peers
        .iter()
        .filter(|p| p.state != Lifecycle::Disconnected)
        .collect();
    live.sort_by_key(|p| p.connected_at);

    let mut dropped: HashSet<PeerId> = HashSet::new();
    let excess = live.len().saturating_sub(config.connection_limit);
    for peer in live
        .iter()
        .filter(|p| p.mode != ConnectionMode::Sync)
        .take(excess)
    {
        plan.disconnect.push((peer.id, DisconnectReason::ExcessConnection));
        dropped.insert(peer.id);
    }

    let expired = live.iter().find(|p| {
        p.mode != ConnectionMode::Sync
            && !dropped.contains(&p.id)
            && now.saturating_duration_since(p.connected_at) > config.connection_ttl
    });
    if let Some(peer) = expired {
        plan.disconnect.push((peer.id, DisconnectReason::Expired));
        dropped.insert(peer.id);
    }

    let remaining = live.len() - dropped.len();
    let wanted = config
        .target_outbound
        .saturating_sub(remaining)
        .min(config.connection_limit.saturating_sub(remaining));
    if wanted > 0 {
        let connected: HashSet<SocketAddr> = live.iter().map(|p| p.addr).collect();
        let mut seen = HashSet::new();
        plan.connect = registry
            .known_addresses(wanted + connected.len(), streams)
            .into_iter()
            .map(|a| a.socket_addr())
            .filter(|addr| !connected.contains(addr) && seen.insert(*addr))
            .take(wanted)
            .collect();
    }

    plan
}
