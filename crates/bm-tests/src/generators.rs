//! Test data generators.

use bm_core::{
    unix_now, Cryptography, NetworkAddress, ObjectEnvelope, ObjectPayload, ObjectType,
    Sha512Cryptography, NETWORK_MAGIC, NODE_NETWORK_SERVICE,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Payload bytes that differ on every call.
pub fn unique_payload(len: usize) -> Bytes {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut data = BytesMut::with_capacity(len.max(8));
    data.put_u64(n);
    data.resize(len.max(8), 0xAB);
    data.freeze()
}

/// A fresh `msg` object without a nonce, expiring in `ttl` seconds.
pub fn msg_object_with_ttl(stream: u64, ttl: i64) -> ObjectEnvelope {
    ObjectEnvelope::new(
        ObjectType::Msg as u32,
        1,
        stream,
        unix_now() + ttl,
        ObjectPayload::Msg {
            encrypted: unique_payload(64),
        },
    )
}

/// A fresh `msg` object without a nonce, expiring in one hour.
pub fn msg_object(stream: u64) -> ObjectEnvelope {
    msg_object_with_ttl(stream, 60 * 60)
}

/// A `getpubkey` request by tag, expiring in one hour.
pub fn getpubkey_object(stream: u64, tag: [u8; 32]) -> ObjectEnvelope {
    ObjectEnvelope::new(
        ObjectType::GetPubkey as u32,
        4,
        stream,
        unix_now() + 60 * 60,
        ObjectPayload::GetPubkey(bm_core::GetPubkey::Tag(tag)),
    )
}

/// Address record for a localhost port.
pub fn local_address(port: u16, stream: u32) -> NetworkAddress {
    NetworkAddress::from_socket_addr(
        SocketAddr::from(([127, 0, 0, 1], port)),
        stream,
        NODE_NETWORK_SERVICE,
        unix_now() as u64,
    )
}

/// Build a raw frame by hand, with a correct checksum.
pub fn raw_frame(command: &str, payload: &[u8]) -> Bytes {
    raw_frame_with_magic(NETWORK_MAGIC, command, payload)
}

/// Build a raw frame with explicit magic bytes.
pub fn raw_frame_with_magic(magic: [u8; 4], command: &str, payload: &[u8]) -> Bytes {
    let checksum = Sha512Cryptography.hash(&[payload]);
    let mut command_field = [0u8; 12];
    command_field[..command.len()].copy_from_slice(command.as_bytes());

    let mut frame = BytesMut::with_capacity(24 + payload.len());
    frame.put_slice(&magic);
    frame.put_slice(&command_field);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&checksum[..4]);
    frame.put_slice(payload);
    frame.freeze()
}
