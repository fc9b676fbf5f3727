//! # bm-core
//!
//! Shared building blocks for the store-and-forward messaging node.
//!
//! This crate provides:
//! - Variable-length integer and string encodings used on the wire
//! - Inventory vectors and object envelopes
//! - Network address records
//! - The ports the protocol engine consumes (inventory, node registry,
//!   cryptography)

mod address;
mod crypto;
pub mod encoding;
mod error;
mod inventory;
mod object;
mod ports;
mod time;

pub use address::{NetworkAddress, NODE_NETWORK_SERVICE};
pub use crypto::{Cryptography, Sha512Cryptography, HASH_SIZE};
pub use error::{CoreError, CoreResult};
pub use inventory::InventoryVector;
pub use object::{
    ExpiryViolation, GetPubkey, ObjectEnvelope, ObjectPayload, ObjectType, MAX_OBJECT_TTL,
    OBJECT_EXPIRY_GRACE,
};
pub use ports::{Inventory, NodeRegistry};
pub use time::unix_now;

/// Network magic that starts every frame.
pub const NETWORK_MAGIC: [u8; 4] = [0xE9, 0xBE, 0xB4, 0xD9];

/// Default P2P port.
pub const DEFAULT_PORT: u16 = 8444;

/// Protocol version this node speaks.
pub const PROTOCOL_VERSION: i32 = 3;

/// Lowest protocol version accepted from a peer.
pub const MIN_PROTOCOL_VERSION: i32 = 3;

/// Network-wide floor for the nonce trials per byte difficulty knob.
pub const NETWORK_NONCE_TRIALS_PER_BYTE: u64 = 1000;

/// Network-wide floor for the extra bytes difficulty knob.
pub const NETWORK_EXTRA_BYTES: u64 = 1000;
