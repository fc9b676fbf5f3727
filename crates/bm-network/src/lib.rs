//! # bm-network
//!
//! P2P layer of the store-and-forward messaging node.
//!
//! This crate provides:
//! - Message framing and payload codecs
//! - The per-connection protocol state machine
//! - Inventory gossip with node-wide request deduplication
//! - Connection pool management
//! - The network service tying it all to TCP

mod codec;
mod connection;
mod error;
mod gossip;
mod message;
mod peer;
mod pool;
mod service;

pub use codec::{parse_command, MessageCodec, COMMAND_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use connection::{
    inventory_messages, Connection, ConnectionEvent, ConnectionMode, CustomCommandHandler,
    DisconnectReason, Lifecycle, NodeContext,
};
pub use error::{NetworkError, NetworkResult};
pub use gossip::{
    missing_vectors, select_offer_targets, IvCache, RequestTracker, SharedIvCache, IV_CACHE_TTL,
    MAX_OFFER_FANOUT,
};
pub use message::{
    CustomMessage, Message, MessageType, VersionMessage, MAX_ADDRESSES_PER_MESSAGE,
    MAX_STREAMS_PER_VERSION, MAX_USER_AGENT_LENGTH, MAX_VECTORS_PER_MESSAGE,
};
pub use peer::{PeerCommand, PeerHandle, PeerId, PeerInfo, PeerTable, StateCounts};
pub use pool::{plan as plan_pool, PoolConfig, PoolPlan};
pub use service::{NetworkConfig, NetworkService, NetworkStatus};
