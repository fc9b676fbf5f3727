//! Core error types.

use thiserror::Error;

/// Errors raised while decoding or building wire primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Not enough bytes to read a field.
    #[error("Truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// A varint used a longer encoding than its value requires.
    #[error("Non-minimal varint encoding for {0}")]
    NonMinimalVarint(u64),

    /// A length or count exceeds the allowed maximum.
    #[error("{what} too large: {size}, max {max}")]
    TooLarge {
        what: &'static str,
        size: u64,
        max: u64,
    },

    /// The object has no nonce yet.
    #[error("Object has no nonce")]
    MissingNonce,

    /// A field holds a value outside its domain.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
