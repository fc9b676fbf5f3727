//! Property-based tests using proptest.
//!
//! These tests verify invariants of the wire encodings, the framing codec
//! and the difficulty formula.

use bm_core::encoding::{get_varint, put_varint, varint_len};
use bm_core::{
    Inventory, InventoryVector, NetworkAddress, ObjectEnvelope, ObjectPayload, Sha512Cryptography,
    NETWORK_MAGIC,
};
use bm_network::{CustomMessage, Message, MessageCodec, VersionMessage};
use bm_pow::PowParams;
use bm_storage::MemoryInventory;
use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use std::net::Ipv6Addr;
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// Strategies
// ============================================================================

fn arb_inventory_vector() -> impl Strategy<Value = InventoryVector> {
    prop::array::uniform32(any::<u8>()).prop_map(InventoryVector)
}

fn arb_network_address() -> impl Strategy<Value = NetworkAddress> {
    (any::<u64>(), any::<u32>(), any::<u64>(), any::<u128>(), any::<u16>()).prop_map(
        |(time, stream, services, ip, port)| NetworkAddress {
            time,
            stream,
            services,
            ip: Ipv6Addr::from(ip),
            port,
        },
    )
}

fn arb_object() -> impl Strategy<Value = ObjectEnvelope> {
    (
        any::<[u8; 8]>(),
        any::<i64>(),
        0u32..6,
        0u64..8,
        1u64..4,
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(nonce, expires, object_type, version, stream, data)| {
            let payload = ObjectPayload::parse(object_type, version, Bytes::from(data));
            ObjectEnvelope::new(object_type, version, stream, expires, payload).with_nonce(nonce)
        })
}

fn arb_version() -> impl Strategy<Value = VersionMessage> {
    (
        any::<i32>(),
        any::<u64>(),
        any::<i64>(),
        arb_network_address(),
        arb_network_address(),
        any::<u64>(),
        "[ -~]{0,64}",
        prop::collection::vec(any::<u64>(), 0..8),
    )
        .prop_map(
            |(version, services, timestamp, recv, from, nonce, user_agent, streams)| {
                // The short layout carries neither time nor stream.
                let short = |a: NetworkAddress| NetworkAddress {
                    time: 0,
                    stream: 0,
                    ..a
                };
                VersionMessage {
                    version,
                    services,
                    timestamp,
                    addr_recv: short(recv),
                    addr_from: short(from),
                    nonce,
                    user_agent,
                    streams,
                }
            },
        )
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        Just(Message::Verack),
        arb_version().prop_map(Message::Version),
        prop::collection::vec(arb_network_address(), 0..20).prop_map(Message::Addr),
        prop::collection::vec(arb_inventory_vector(), 0..50).prop_map(Message::Inv),
        prop::collection::vec(arb_inventory_vector(), 0..50).prop_map(Message::GetData),
        arb_object().prop_map(Message::Object),
        ("[a-zA-Z_]{1,16}", prop::collection::vec(any::<u8>(), 0..128))
            .prop_map(|(command, data)| Message::Custom(CustomMessage::new(command, data))),
    ]
}

fn encode(message: Message) -> BytesMut {
    let mut buf = BytesMut::new();
    MessageCodec::default()
        .encode(message, &mut buf)
        .expect("encodable message");
    buf
}

// ============================================================================
// Encoding Properties
// ============================================================================

proptest! {
    /// Varints decode to their value and take the advertised length.
    #[test]
    fn prop_varint_roundtrip(value in any::<u64>()) {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        prop_assert_eq!(buf.len(), varint_len(value));

        let mut bytes = buf.freeze();
        prop_assert_eq!(get_varint(&mut bytes).unwrap(), value);
        prop_assert!(bytes.is_empty());
    }

    /// A value that fits a shorter form is rejected in a longer one.
    #[test]
    fn prop_non_minimal_varint_rejected(value in 0u64..0xFD) {
        let mut bytes = Bytes::from(vec![0xFD, 0x00, value as u8]);
        prop_assert!(get_varint(&mut bytes).is_err());
    }

    /// Re-encoding a decoded object reproduces the original bytes, whatever
    /// the payload shape.
    #[test]
    fn prop_object_bytes_are_preserved(object in arb_object()) {
        let wire = object.to_bytes().unwrap();
        let decoded = ObjectEnvelope::decode(wire.clone()).unwrap();
        prop_assert_eq!(decoded.to_bytes().unwrap(), wire);
    }

    /// Inventory vectors only depend on the wire bytes.
    #[test]
    fn prop_inventory_vector_survives_decoding(object in arb_object()) {
        let crypto = Sha512Cryptography;
        let decoded = ObjectEnvelope::decode(object.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(
            decoded.inventory_vector(&crypto).unwrap(),
            object.inventory_vector(&crypto).unwrap()
        );
    }
}

// ============================================================================
// Codec Properties
// ============================================================================

proptest! {
    /// Every message survives a trip through the frame codec.
    #[test]
    fn prop_message_roundtrip(message in arb_message()) {
        let mut buf = encode(message.clone());
        prop_assert_eq!(&buf[..4], &NETWORK_MAGIC[..]);

        let decoded = MessageCodec::default().decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(message));
        prop_assert!(buf.is_empty());
    }

    /// Splitting a frame at any point yields the same message once the
    /// rest arrives.
    #[test]
    fn prop_split_frames_decode(message in arb_message(), split in any::<prop::sample::Index>()) {
        let frame = encode(message.clone());
        let at = split.index(frame.len());

        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&frame[..at]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[at..]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(message));
    }

    /// Garbage before a frame is skipped.
    #[test]
    fn prop_garbage_prefix_is_skipped(
        garbage in prop::collection::vec(any::<u8>(), 0..512)
            .prop_filter("no magic in garbage", |g| {
                !g.windows(4).any(|w| w == NETWORK_MAGIC)
            }),
        message in arb_message(),
    ) {
        let mut buf = BytesMut::from(&garbage[..]);
        buf.extend_from_slice(&encode(message.clone()));

        let decoded = MessageCodec::default().decode(&mut buf).unwrap();
        prop_assert_eq!(decoded, Some(message));
    }
}

// ============================================================================
// Difficulty Properties
// ============================================================================

proptest! {
    /// Bigger payloads never get an easier target.
    #[test]
    fn prop_target_shrinks_with_length(len in 0usize..1_000_000, extra in 1usize..10_000, ttl in 0i64..2_419_200) {
        let params = PowParams::new(1000, 1000);
        prop_assert!(bm_pow::target(len + extra, ttl, &params) <= bm_pow::target(len, ttl, &params));
    }

    /// Longer lifetimes never get an easier target.
    #[test]
    fn prop_target_shrinks_with_ttl(len in 0usize..100_000, ttl in 0i64..2_419_200, more in 1i64..100_000) {
        let params = PowParams::new(1000, 1000);
        prop_assert!(bm_pow::target(len, ttl + more, &params) <= bm_pow::target(len, ttl, &params));
    }

    /// Difficulty knobs below the network floor are raised.
    #[test]
    fn prop_floors_are_enforced(ntpb in 0u64..5000, extra in 0u64..5000) {
        let params = PowParams::new(ntpb, extra);
        prop_assert!(params.nonce_trials_per_byte() >= 1000);
        prop_assert!(params.extra_bytes() >= 1000);
    }
}

// ============================================================================
// Storage Properties
// ============================================================================

proptest! {
    /// Storing the same object twice keeps one copy.
    #[test]
    fn prop_store_is_idempotent(objects in prop::collection::vec(arb_object(), 1..20)) {
        let crypto = Sha512Cryptography;
        let inventory = MemoryInventory::new();
        let mut distinct = std::collections::HashSet::new();

        for object in &objects {
            let iv = object.inventory_vector(&crypto).unwrap();
            prop_assert_eq!(inventory.store(iv, object.clone()), distinct.insert(iv));
            prop_assert!(!inventory.store(iv, object.clone()));
        }
        prop_assert_eq!(inventory.len(), distinct.len());
    }
}
