//! # bm-pow
//!
//! Proof-of-work for network objects.
//!
//! This crate provides:
//! - Target computation from payload size, TTL and difficulty knobs
//! - Parallel nonce search over disjoint residue classes
//! - Verification of received objects
//! - An engine caching found nonces by initial hash

mod engine;
mod error;
mod target;
mod worker;

pub use engine::{ProofOfWorkEngine, MAX_CACHED_NONCES};
pub use error::{PowError, PowResult};
pub use target::{meets_target, object_target, target, trial_value, verify, PowParams};
pub use worker::{CancelHandle, WorkerPool, MAX_WORKERS};
