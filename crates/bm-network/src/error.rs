//! Network error types.

use bm_core::CoreError;
use bm_pow::PowError;
use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid message payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Malformed command field.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Payload checksum mismatch.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The service is not running.
    #[error("Network service not running")]
    NotRunning,

    /// The service is already running.
    #[error("Network service already running")]
    AlreadyRunning,

    /// Encoding error.
    #[error("Encoding error: {0}")]
    Core(#[from] CoreError),

    /// Proof-of-work error.
    #[error("Proof-of-work error: {0}")]
    Pow(#[from] PowError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
