//! Network objects.
//!
//! Wire layout of an object:
//!
//! ```text
//! +-------+---------+------+---------+--------+---------+
//! | nonce | expires | type | version | stream | payload |
//! |  8 B  |  i64    | u32  | varint  | varint |  rest   |
//! +-------+---------+------+---------+--------+---------+
//! ```
//!
//! Everything after the nonce is the "payload without nonce" that the
//! proof-of-work and the inventory vector are computed over.

use crate::encoding::{ensure_remaining, get_array, get_varint, put_varint, varint_len};
use crate::{CoreError, CoreResult, Cryptography, InventoryVector, HASH_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Longest lifetime an object may declare, in seconds (28 days + 3 hours).
pub const MAX_OBJECT_TTL: i64 = 28 * 24 * 60 * 60 + 3 * 60 * 60;

/// How long after expiry an object is still accepted, in seconds.
pub const OBJECT_EXPIRY_GRACE: i64 = 3 * 60 * 60;

/// Known object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectType {
    /// Public key request.
    GetPubkey = 0,
    /// Public key announcement.
    Pubkey = 1,
    /// Person-to-person message.
    Msg = 2,
    /// Broadcast message.
    Broadcast = 3,
}

impl ObjectType {
    /// Map a raw type number.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::GetPubkey),
            1 => Some(Self::Pubkey),
            2 => Some(Self::Msg),
            3 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Target of a public key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetPubkey {
    /// Address versions 2 and 3 ask by RIPEMD-160 hash.
    Ripe([u8; 20]),
    /// Address version 4 asks by tag.
    Tag([u8; 32]),
}

/// Type-specific object payload.
///
/// Encrypted parts stay opaque here; decrypting them is the application's
/// business. Any type/version combination the node does not understand is
/// kept as [`ObjectPayload::Opaque`] and relayed unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    /// `getpubkey` v2-v4.
    GetPubkey(GetPubkey),
    /// `pubkey` v4.
    Pubkey { tag: [u8; 32], encrypted: Bytes },
    /// `msg` v1.
    Msg { encrypted: Bytes },
    /// `broadcast` v4 (no tag) and v5 (tagged).
    Broadcast {
        tag: Option<[u8; 32]>,
        encrypted: Bytes,
    },
    /// Anything else.
    Opaque(Bytes),
}

impl ObjectPayload {
    /// Interpret payload bytes. Never fails: unrecognised shapes become opaque.
    pub fn parse(object_type: u32, version: u64, data: Bytes) -> Self {
        match (ObjectType::from_u32(object_type), version) {
            (Some(ObjectType::GetPubkey), 2 | 3) if data.len() == 20 => {
                let mut ripe = [0u8; 20];
                ripe.copy_from_slice(&data);
                Self::GetPubkey(GetPubkey::Ripe(ripe))
            }
            (Some(ObjectType::GetPubkey), 4) if data.len() == 32 => {
                let mut tag = [0u8; 32];
                tag.copy_from_slice(&data);
                Self::GetPubkey(GetPubkey::Tag(tag))
            }
            (Some(ObjectType::Pubkey), 4) if data.len() >= 32 => {
                let (tag, encrypted) = split_tag(data);
                Self::Pubkey { tag, encrypted }
            }
            (Some(ObjectType::Msg), 1) => Self::Msg { encrypted: data },
            (Some(ObjectType::Broadcast), 4) => Self::Broadcast {
                tag: None,
                encrypted: data,
            },
            (Some(ObjectType::Broadcast), 5) if data.len() >= 32 => {
                let (tag, encrypted) = split_tag(data);
                Self::Broadcast {
                    tag: Some(tag),
                    encrypted,
                }
            }
            _ => Self::Opaque(data),
        }
    }

    /// Encoded length.
    pub fn len(&self) -> usize {
        match self {
            Self::GetPubkey(GetPubkey::Ripe(_)) => 20,
            Self::GetPubkey(GetPubkey::Tag(_)) => 32,
            Self::Pubkey { encrypted, .. } => 32 + encrypted.len(),
            Self::Msg { encrypted } => encrypted.len(),
            Self::Broadcast { tag, encrypted } => {
                tag.map(|_| 32).unwrap_or(0) + encrypted.len()
            }
            Self::Opaque(data) => data.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the payload bytes.
    pub fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::GetPubkey(GetPubkey::Ripe(ripe)) => buf.put_slice(ripe),
            Self::GetPubkey(GetPubkey::Tag(tag)) => buf.put_slice(tag),
            Self::Pubkey { tag, encrypted } => {
                buf.put_slice(tag);
                buf.put_slice(encrypted);
            }
            Self::Msg { encrypted } => buf.put_slice(encrypted),
            Self::Broadcast { tag, encrypted } => {
                if let Some(tag) = tag {
                    buf.put_slice(tag);
                }
                buf.put_slice(encrypted);
            }
            Self::Opaque(data) => buf.put_slice(data),
        }
    }
}

fn split_tag(mut data: Bytes) -> ([u8; 32], Bytes) {
    let mut tag = [0u8; 32];
    data.copy_to_slice(&mut tag);
    (tag, data)
}

/// Why an object's expiration is outside the accepted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryViolation {
    /// Expired longer ago than the grace period.
    Expired { seconds_ago: i64 },
    /// Expires further in the future than allowed.
    TooFarInFuture { ttl: i64 },
}

impl fmt::Display for ExpiryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { seconds_ago } => write!(f, "expired {seconds_ago}s ago"),
            Self::TooFarInFuture { ttl } => write!(f, "ttl of {ttl}s exceeds maximum"),
        }
    }
}

/// An object as carried by the `object` message.
///
/// Immutable once built; [`ObjectEnvelope::with_nonce`] returns a new value,
/// so a derived inventory vector can never go stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEnvelope {
    nonce: Option<[u8; 8]>,
    expires_time: i64,
    object_type: u32,
    version: u64,
    stream: u64,
    payload: ObjectPayload,
}

impl ObjectEnvelope {
    /// Create an object without a nonce.
    pub fn new(
        object_type: u32,
        version: u64,
        stream: u64,
        expires_time: i64,
        payload: ObjectPayload,
    ) -> Self {
        Self {
            nonce: None,
            expires_time,
            object_type,
            version,
            stream,
            payload,
        }
    }

    /// Return a copy carrying `nonce`.
    pub fn with_nonce(mut self, nonce: [u8; 8]) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Proof-of-work nonce, once computed.
    pub fn nonce(&self) -> Option<[u8; 8]> {
        self.nonce
    }

    /// Unix expiration time.
    pub fn expires_time(&self) -> i64 {
        self.expires_time
    }

    /// Raw object type.
    pub fn object_type(&self) -> u32 {
        self.object_type
    }

    /// Known object type, if any.
    pub fn kind(&self) -> Option<ObjectType> {
        ObjectType::from_u32(self.object_type)
    }

    /// Object version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stream number.
    pub fn stream(&self) -> u64 {
        self.stream
    }

    /// Type-specific payload.
    pub fn payload(&self) -> &ObjectPayload {
        &self.payload
    }

    /// Seconds until expiration (negative once expired).
    pub fn ttl(&self, now: i64) -> i64 {
        self.expires_time - now
    }

    /// Check the expiration against the accepted window.
    pub fn check_expiry(&self, now: i64) -> Result<(), ExpiryViolation> {
        let ttl = self.ttl(now);
        if ttl > MAX_OBJECT_TTL {
            return Err(ExpiryViolation::TooFarInFuture { ttl });
        }
        if ttl < -OBJECT_EXPIRY_GRACE {
            return Err(ExpiryViolation::Expired { seconds_ago: -ttl });
        }
        Ok(())
    }

    /// Length of the bytes after the nonce.
    pub fn payload_without_nonce_len(&self) -> usize {
        8 + 4 + varint_len(self.version) + varint_len(self.stream) + self.payload.len()
    }

    /// Everything after the nonce.
    pub fn payload_without_nonce(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload_without_nonce_len());
        self.write_without_nonce(&mut buf);
        buf.freeze()
    }

    fn write_without_nonce(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.expires_time);
        buf.put_u32(self.object_type);
        put_varint(buf, self.version);
        put_varint(buf, self.stream);
        self.payload.write(buf);
    }

    /// Hash of the payload without nonce, the input to the nonce search.
    pub fn initial_hash(&self, crypto: &dyn Cryptography) -> [u8; HASH_SIZE] {
        let payload = self.payload_without_nonce();
        crypto.hash(&[&payload[..]])
    }

    /// Derive the inventory vector. Requires a nonce.
    pub fn inventory_vector(&self, crypto: &dyn Cryptography) -> CoreResult<InventoryVector> {
        let nonce = self.nonce.ok_or(CoreError::MissingNonce)?;
        let payload = self.payload_without_nonce();
        let hash = crypto.double_hash(&[&nonce[..], &payload[..]]);
        Ok(InventoryVector::from_hash(&hash))
    }

    /// Write the full wire form. Requires a nonce.
    pub fn write(&self, buf: &mut impl BufMut) -> CoreResult<()> {
        let nonce = self.nonce.ok_or(CoreError::MissingNonce)?;
        buf.put_slice(&nonce);
        self.write_without_nonce(buf);
        Ok(())
    }

    /// Full wire form. Requires a nonce.
    pub fn to_bytes(&self) -> CoreResult<Bytes> {
        let mut buf = BytesMut::with_capacity(8 + self.payload_without_nonce_len());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse the full wire form; the payload is everything that remains.
    pub fn decode(mut bytes: Bytes) -> CoreResult<Self> {
        let nonce = get_array::<8>(&mut bytes, "object nonce")?;
        ensure_remaining(&bytes, 12, "object header")?;
        let expires_time = bytes.get_i64();
        let object_type = bytes.get_u32();
        let version = get_varint(&mut bytes)?;
        let stream = get_varint(&mut bytes)?;
        let payload = ObjectPayload::parse(object_type, version, bytes);
        Ok(Self {
            nonce: Some(nonce),
            expires_time,
            object_type,
            version,
            stream,
            payload,
        })
    }
}
