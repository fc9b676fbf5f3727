//! Cryptography port.
//!
//! The engine only needs hashing and nonce generation. Key agreement,
//! signatures and payload encryption belong to the application layer that
//! builds and reads object payloads.

use sha2::{Digest, Sha512};

/// Size of a hash output in bytes.
pub const HASH_SIZE: usize = 64;

/// Hashing primitives consumed by the protocol engine.
///
/// Implementations are shared across all connection tasks and the
/// proof-of-work workers, so they must be cheap to call concurrently.
pub trait Cryptography: Send + Sync + 'static {
    /// Hash the concatenation of `parts`.
    fn hash(&self, parts: &[&[u8]]) -> [u8; HASH_SIZE];

    /// Hash the hash of the concatenation of `parts`.
    fn double_hash(&self, parts: &[&[u8]]) -> [u8; HASH_SIZE] {
        let first = self.hash(parts);
        self.hash(&[&first[..]])
    }

    /// A fresh random 64-bit nonce.
    fn random_nonce(&self) -> u64 {
        rand::random()
    }
}

/// SHA-512 implementation used by the live network.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha512Cryptography;

impl Cryptography for Sha512Cryptography {
    fn hash(&self, parts: &[&[u8]]) -> [u8; HASH_SIZE] {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}
