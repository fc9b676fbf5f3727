//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use bm_core::{DEFAULT_PORT, NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE};
use bm_network::NetworkConfig;
use bm_pow::PowParams;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// P2P configuration.
    #[serde(default)]
    pub network: P2pConfig,
    /// Proof-of-work configuration.
    #[serde(default)]
    pub pow: PowConfig,
    /// Object inventory configuration.
    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// P2P configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Bind address (without port).
    pub bind_address: String,
    /// Listen port.
    pub port: u16,
    /// Maximum number of connections.
    pub connection_limit: usize,
    /// Connection lifetime before rotation, in seconds.
    pub connection_ttl_secs: u64,
    /// Timer granularity of connection tasks, in seconds.
    pub read_timeout_secs: u64,
    /// Inactivity allowed with outstanding requests, in seconds.
    pub idle_timeout_secs: u64,
    /// Pool sweep interval, in seconds.
    pub sweep_interval_secs: u64,
    /// Dial new peers while fewer connections than this exist.
    pub target_outbound: usize,
    /// Streams to serve.
    pub streams: Vec<u64>,
    /// User agent override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Peers seeding the registry.
    pub known_peers: Vec<String>,
    /// Peers dialed on start-up.
    pub connect: Vec<String>,
    /// Resolve the DNS bootstrap hosts on start-up.
    pub dns_bootstrap: bool,
    /// Timeout of a one-shot sync, in seconds.
    pub sync_timeout_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connection_limit: 150,
            connection_ttl_secs: 30 * 60,
            read_timeout_secs: 2,
            idle_timeout_secs: 120,
            sweep_interval_secs: 30,
            target_outbound: 8,
            streams: vec![1],
            user_agent: None,
            known_peers: Vec::new(),
            connect: Vec::new(),
            dns_bootstrap: true,
            sync_timeout_secs: 120,
        }
    }
}

/// Proof-of-work configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowConfig {
    /// Nonce trials per byte. Values below the network floor are raised.
    pub nonce_trials_per_byte: u64,
    /// Extra bytes. Values below the network floor are raised.
    pub extra_bytes: u64,
    /// Worker threads (0 = one per core).
    pub threads: usize,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
            extra_bytes: NETWORK_EXTRA_BYTES,
            threads: 0,
        }
    }
}

/// Inventory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Interval of the expired object cleanup, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 5 * 60,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config: NodeConfig = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        // Only override if explicitly provided via CLI
        if let Some(port) = args.port {
            config.network.port = port;
        }
        if let Some(ref bind) = args.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(secs) = args.sync_timeout {
            config.network.sync_timeout_secs = secs;
        }
        if let Some(threads) = args.pow_threads {
            config.pow.threads = threads;
        }
        if args.no_bootstrap {
            config.network.dns_bootstrap = false;
        }
        config.network.connect.extend(args.connect.iter().cloned());

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.network.streams.is_empty() {
            anyhow::bail!("At least one stream must be configured");
        }
        if self.network.read_timeout_secs == 0 || self.network.sweep_interval_secs == 0 {
            anyhow::bail!("Timer intervals must be positive");
        }
        if self.inventory.cleanup_interval_secs == 0 {
            anyhow::bail!("Inventory cleanup interval must be positive");
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .network
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address {}", self.network.bind_address))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Settings for the network service.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let defaults = NetworkConfig::default();
        let p2p = &self.network;
        Ok(NetworkConfig {
            listen_addr: self.listen_addr()?,
            user_agent: p2p.user_agent.clone().unwrap_or(defaults.user_agent.clone()),
            streams: p2p.streams.clone(),
            connection_limit: p2p.connection_limit,
            connection_ttl: Duration::from_secs(p2p.connection_ttl_secs),
            target_outbound: p2p.target_outbound,
            read_timeout: Duration::from_secs(p2p.read_timeout_secs),
            idle_timeout: Duration::from_secs(p2p.idle_timeout_secs),
            sweep_interval: Duration::from_secs(p2p.sweep_interval_secs),
            ..defaults
        })
    }

    /// Difficulty, clamped to the network floors.
    pub fn pow_params(&self) -> PowParams {
        PowParams::new(self.pow.nonce_trials_per_byte, self.pow.extra_bytes)
    }

    /// Proof-of-work thread count, `None` for one per core.
    pub fn pow_threads(&self) -> Option<usize> {
        match self.pow.threads {
            0 => None,
            n => Some(n),
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
