//! Proof-of-work engine.
//!
//! Ties target computation and the worker pool together, and remembers
//! nonces it has already found so retrying a failed publish does not cost a
//! second search. Entries are dropped once the object is published.

use crate::target::{self, PowParams};
use crate::worker::{CancelHandle, WorkerPool};
use crate::{PowError, PowResult};
use bm_core::{unix_now, Cryptography, ObjectEnvelope, HASH_SIZE};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Upper bound on remembered nonces.
pub const MAX_CACHED_NONCES: usize = 1024;

/// Proof-of-work engine shared by every task of a node.
pub struct ProofOfWorkEngine {
    crypto: Arc<dyn Cryptography>,
    params: PowParams,
    pool: WorkerPool,
    cache: DashMap<[u8; HASH_SIZE], u64>,
}

impl ProofOfWorkEngine {
    /// Create an engine. `threads` of `None` uses every available core.
    pub fn new(crypto: Arc<dyn Cryptography>, params: PowParams, threads: Option<usize>) -> Self {
        let pool = match threads {
            Some(n) => WorkerPool::new(n),
            None => WorkerPool::with_available_parallelism(),
        };
        debug!(
            workers = pool.num_workers(),
            nonce_trials_per_byte = params.nonce_trials_per_byte(),
            extra_bytes = params.extra_bytes(),
            "Proof-of-work engine created"
        );
        Self {
            crypto,
            params,
            pool,
            cache: DashMap::new(),
        }
    }

    /// Difficulty knobs in effect.
    pub fn params(&self) -> &PowParams {
        &self.params
    }

    /// Hash functions in use.
    pub fn crypto(&self) -> &Arc<dyn Cryptography> {
        &self.crypto
    }

    /// Target for `object` at time `now`.
    pub fn target(&self, object: &ObjectEnvelope, now: i64) -> u64 {
        target::object_target(object, now, &self.params)
    }

    /// Search for a nonce over an initial hash.
    pub fn search(
        &self,
        initial_hash: [u8; HASH_SIZE],
        target: u64,
        cancel: &CancelHandle,
    ) -> PowResult<u64> {
        self.pool
            .search(Arc::clone(&self.crypto), initial_hash, target, cancel)
    }

    /// Check the nonce carried by `object`.
    pub fn verify(&self, object: &ObjectEnvelope, now: i64) -> PowResult<()> {
        target::verify(self.crypto.as_ref(), object, now, &self.params)
    }

    /// Whether `object` carries a sufficient nonce.
    pub fn is_valid(&self, object: &ObjectEnvelope, now: i64) -> bool {
        self.verify(object, now).is_ok()
    }

    /// Compute a nonce for `object` and return it with the nonce set.
    #[instrument(skip_all, fields(object_type = object.object_type()))]
    pub fn do_work(&self, object: ObjectEnvelope, cancel: &CancelHandle) -> PowResult<ObjectEnvelope> {
        let initial_hash = object.initial_hash(self.crypto.as_ref());
        let target = self.target(&object, unix_now());

        if let Some(nonce) = self.cache.get(&initial_hash).map(|n| *n) {
            if target::meets_target(self.crypto.as_ref(), nonce, &initial_hash, target) {
                debug!(nonce, "Reusing cached proof-of-work");
                return Ok(object.with_nonce(nonce.to_be_bytes()));
            }
        }

        let nonce = self.search(initial_hash, target, cancel)?;
        if self.cache.len() >= MAX_CACHED_NONCES {
            let victim = self.cache.iter().next().map(|entry| *entry.key());
            if let Some(key) = victim {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(initial_hash, nonce);
        Ok(object.with_nonce(nonce.to_be_bytes()))
    }

    /// Run [`do_work`](Self::do_work) on the blocking thread pool.
    pub async fn do_work_async(
        self: &Arc<Self>,
        object: ObjectEnvelope,
        cancel: CancelHandle,
    ) -> PowResult<ObjectEnvelope> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.do_work(object, &cancel))
            .await
            .map_err(|e| PowError::Task(e.to_string()))?
    }

    /// Number of cached nonces.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forget the cached nonce for `object`, once it no longer needs one.
    pub fn forget(&self, object: &ObjectEnvelope) {
        self.cache.remove(&object.initial_hash(self.crypto.as_ref()));
    }

    /// Forget every cached nonce.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_core::{ObjectPayload, Sha512Cryptography};
    use bytes::Bytes;

    fn engine() -> Arc<ProofOfWorkEngine> {
        Arc::new(ProofOfWorkEngine::new(
            Arc::new(Sha512Cryptography),
            PowParams::with_floors(1, 1, 1, 1),
            Some(2),
        ))
    }

    fn object(ttl: i64) -> ObjectEnvelope {
        ObjectEnvelope::new(
            2,
            1,
            1,
            unix_now() + ttl,
            ObjectPayload::Opaque(Bytes::from_static(b"encrypted message body")),
        )
    }

    #[test]
    fn test_do_work_then_verify() {
        let engine = engine();
        let done = engine.do_work(object(3600), &CancelHandle::new()).unwrap();
        assert!(done.nonce().is_some());
        assert!(engine.is_valid(&done, unix_now()));
        assert_eq!(engine.cached(), 1);
    }

    #[test]
    fn test_cache_reuses_nonce() {
        let engine = engine();
        let unsent = object(3600);
        let first = engine.do_work(unsent.clone(), &CancelHandle::new()).unwrap();

        // A cancelled handle would fail a real search.
        let cancel = CancelHandle::new();
        cancel.cancel();
        let second = engine.do_work(unsent, &cancel).unwrap();
        assert_eq!(first.nonce(), second.nonce());
    }

    #[test]
    fn test_forget_drops_cached_nonce() {
        let engine = engine();
        let done = engine.do_work(object(3600), &CancelHandle::new()).unwrap();
        assert_eq!(engine.cached(), 1);

        // The initial hash ignores the nonce, so the mined copy finds the entry.
        engine.forget(&done);
        assert_eq!(engine.cached(), 0);
    }

    #[test]
    fn test_cache_is_bounded() {
        let engine = engine();
        for i in 0..MAX_CACHED_NONCES + 10 {
            let unsent = ObjectEnvelope::new(
                2,
                1,
                1,
                unix_now() + 3600,
                ObjectPayload::Opaque(Bytes::from((i as u64).to_be_bytes().to_vec())),
            );
            engine.do_work(unsent, &CancelHandle::new()).unwrap();
        }
        assert_eq!(engine.cached(), MAX_CACHED_NONCES);
    }

    #[test]
    fn test_verify_rejects_bad_nonce() {
        let engine = Arc::new(ProofOfWorkEngine::new(
            Arc::new(Sha512Cryptography),
            PowParams::default(),
            Some(1),
        ));
        // Zero nonce against the network difficulty fails unless extremely lucky.
        let forged = object(4 * 24 * 3600).with_nonce([0u8; 8]);
        assert!(matches!(
            engine.verify(&forged, unix_now()),
            Err(PowError::InsufficientWork { .. })
        ));
    }

    #[tokio::test]
    async fn test_do_work_async() {
        let engine = engine();
        let done = engine
            .do_work_async(object(0), CancelHandle::new())
            .await
            .unwrap();
        assert!(engine.is_valid(&done, unix_now()));
    }
}
