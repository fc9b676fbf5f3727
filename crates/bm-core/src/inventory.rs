//! Inventory vectors.

use crate::{CoreError, CoreResult, HASH_SIZE};
use std::fmt;

/// 32-byte identifier of a network object.
///
/// Always derived from the object bytes (`double_hash(nonce || payload)`),
/// never chosen.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InventoryVector(pub [u8; 32]);

impl InventoryVector {
    /// Size in bytes.
    pub const SIZE: usize = 32;

    /// Truncate a hash output into an inventory vector.
    pub fn from_hash(hash: &[u8; HASH_SIZE]) -> Self {
        let mut iv = [0u8; 32];
        iv.copy_from_slice(&hash[..32]);
        Self(iv)
    }

    /// Create from a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> CoreResult<Self> {
        let iv: [u8; 32] = bytes.try_into().map_err(|_| {
            CoreError::InvalidValue(format!("inventory vector of {} bytes", bytes.len()))
        })?;
        Ok(Self(iv))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InventoryVector({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hash_truncates() {
        let mut hash = [0u8; HASH_SIZE];
        hash[0] = 0xAB;
        hash[31] = 0xCD;
        hash[32] = 0xEF;
        let iv = InventoryVector::from_hash(&hash);
        assert_eq!(iv.0[0], 0xAB);
        assert_eq!(iv.0[31], 0xCD);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(InventoryVector::from_slice(&[0u8; 32]).is_ok());
        assert!(InventoryVector::from_slice(&[0u8; 31]).is_err());
    }
}
