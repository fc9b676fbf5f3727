//! Proof-of-work error types.

use thiserror::Error;

/// Proof-of-work errors.
#[derive(Error, Debug)]
pub enum PowError {
    /// No worker could be started.
    #[error("No compute units available for proof-of-work")]
    NoComputeUnits,

    /// Worker thread could not be spawned.
    #[error("Failed to spawn proof-of-work worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A worker thread panicked.
    #[error("Proof-of-work worker panicked")]
    WorkerPanicked,

    /// The search was cancelled before a nonce was found.
    #[error("Proof-of-work search cancelled")]
    Cancelled,

    /// Every worker exhausted its share of the nonce space.
    #[error("Nonce space exhausted")]
    Exhausted,

    /// The object carries no nonce.
    #[error("Object has no nonce")]
    MissingNonce,

    /// The nonce does not satisfy the target.
    #[error("Insufficient proof-of-work: trial value {value:#018x} exceeds target {target:#018x}")]
    InsufficientWork {
        /// Trial value of the stored nonce.
        value: u64,
        /// Required target.
        target: u64,
    },

    /// Background task failed.
    #[error("Proof-of-work task failed: {0}")]
    Task(String),
}

/// Result type for proof-of-work operations.
pub type PowResult<T> = Result<T, PowError>;
