//! Target computation and nonce checks.

use crate::{PowError, PowResult};
use bm_core::{
    Cryptography, ObjectEnvelope, HASH_SIZE, NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE,
};

/// TTL scaling divisor of the target formula.
const TTL_DIVISOR: u128 = 1 << 16;

/// Difficulty knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowParams {
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
}

impl PowParams {
    /// Knobs clamped up to the network floors.
    pub fn new(nonce_trials_per_byte: u64, extra_bytes: u64) -> Self {
        Self::with_floors(
            nonce_trials_per_byte,
            extra_bytes,
            NETWORK_NONCE_TRIALS_PER_BYTE,
            NETWORK_EXTRA_BYTES,
        )
    }

    /// Knobs clamped up to custom floors. Private test networks use this to
    /// run with a cheaper difficulty; a zero floor still clamps to one.
    pub fn with_floors(
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
        min_nonce_trials_per_byte: u64,
        min_extra_bytes: u64,
    ) -> Self {
        Self {
            nonce_trials_per_byte: nonce_trials_per_byte.max(min_nonce_trials_per_byte).max(1),
            extra_bytes: extra_bytes.max(min_extra_bytes),
        }
    }

    /// Effective nonce trials per byte.
    pub fn nonce_trials_per_byte(&self) -> u64 {
        self.nonce_trials_per_byte
    }

    /// Effective extra bytes.
    pub fn extra_bytes(&self) -> u64 {
        self.extra_bytes
    }
}

impl Default for PowParams {
    fn default() -> Self {
        Self::new(NETWORK_NONCE_TRIALS_PER_BYTE, NETWORK_EXTRA_BYTES)
    }
}

/// Target for a payload of `payload_len` bytes (nonce excluded) living for
/// `ttl` seconds. Negative TTLs count as zero.
pub fn target(payload_len: usize, ttl: i64, params: &PowParams) -> u64 {
    let ttl = ttl.max(0) as u128;
    let length = payload_len as u128 + params.extra_bytes as u128;
    let denominator = (params.nonce_trials_per_byte as u128)
        .saturating_mul(length.saturating_add(length.saturating_mul(ttl) / TTL_DIVISOR));
    if denominator == 0 {
        return u64::MAX;
    }
    let quotient = (1u128 << 64) / denominator;
    u64::try_from(quotient).unwrap_or(u64::MAX)
}

/// Target for an object at time `now`.
pub fn object_target(object: &ObjectEnvelope, now: i64, params: &PowParams) -> u64 {
    target(object.payload_without_nonce_len(), object.ttl(now), params)
}

/// Leading eight bytes of `doubleHash(nonce ∥ initial_hash)` as a big-endian
/// integer.
pub fn trial_value(crypto: &dyn Cryptography, nonce: u64, initial_hash: &[u8; HASH_SIZE]) -> u64 {
    let nonce = nonce.to_be_bytes();
    let hash = crypto.double_hash(&[&nonce[..], &initial_hash[..]]);
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(leading)
}

/// Whether `nonce` satisfies `target`. A trial value equal to the target
/// passes.
pub fn meets_target(
    crypto: &dyn Cryptography,
    nonce: u64,
    initial_hash: &[u8; HASH_SIZE],
    target: u64,
) -> bool {
    trial_value(crypto, nonce, initial_hash) <= target
}

/// Check the nonce carried by `object` against its target at `now`.
pub fn verify(
    crypto: &dyn Cryptography,
    object: &ObjectEnvelope,
    now: i64,
    params: &PowParams,
) -> PowResult<()> {
    let nonce = object.nonce().ok_or(PowError::MissingNonce)?;
    let target = object_target(object, now, params);
    let value = trial_value(crypto, u64::from_be_bytes(nonce), &object.initial_hash(crypto));
    if value <= target {
        Ok(())
    } else {
        Err(PowError::InsufficientWork { value, target })
    }
}
