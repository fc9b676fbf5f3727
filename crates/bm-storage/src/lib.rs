//! # bm-storage
//!
//! Reference implementations of the storage ports.
//!
//! This crate provides:
//! - A concurrent in-memory object inventory with expiry cleanup
//! - A node registry with address freshness and bootstrap fallback
//! - DNS bootstrap discovery

pub mod discovery;
mod inventory;
mod registry;

pub use discovery::{parse_peer_address, BootstrapDiscovery, BOOTSTRAP_DNS_SEEDS};
pub use inventory::{MemoryInventory, INVENTORY_RETENTION_GRACE};
pub use registry::{MemoryNodeRegistry, ADDRESS_FRESHNESS, MAX_KNOWN_ADDRESSES};
