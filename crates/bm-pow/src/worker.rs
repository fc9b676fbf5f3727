//! Parallel nonce search.
//!
//! The nonce space is split into residue classes: with `N` workers, worker
//! `i` tries `i, i + N, i + 2N, ...`. No two workers ever hash the same
//! nonce and together they cover the whole space. The first worker to hit
//! the target stops its siblings.

use crate::target::trial_value;
use crate::{PowError, PowResult};
use bm_core::{Cryptography, HASH_SIZE};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Nonces tried between two checks of the stop flags.
const BATCH_SIZE: u64 = 1024;

/// Upper bound on the number of workers.
pub const MAX_WORKERS: usize = 255;

/// Cooperative cancellation of a running search.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create a handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One search job shared by every worker.
struct SearchJob {
    crypto: Arc<dyn Cryptography>,
    initial_hash: [u8; HASH_SIZE],
    target: u64,
    stride: u64,
}

/// A worker thread scanning one residue class.
struct SearchWorker {
    id: usize,
    handle: JoinHandle<()>,
}

impl SearchWorker {
    fn spawn(
        id: usize,
        job: Arc<SearchJob>,
        found: Arc<AtomicBool>,
        cancel: CancelHandle,
        hash_count: Arc<AtomicU64>,
        result_tx: mpsc::Sender<u64>,
    ) -> PowResult<Self> {
        let handle = thread::Builder::new()
            .name(format!("pow-worker-{}", id))
            .spawn(move || {
                Self::worker_loop(id, &job, &found, &cancel, &hash_count, result_tx);
            })
            .map_err(PowError::WorkerSpawn)?;

        Ok(Self { id, handle })
    }

    fn worker_loop(
        id: usize,
        job: &SearchJob,
        found: &AtomicBool,
        cancel: &CancelHandle,
        hash_count: &AtomicU64,
        result_tx: mpsc::Sender<u64>,
    ) {
        let mut nonce = id as u64;

        loop {
            if found.load(Ordering::Relaxed) || cancel.is_cancelled() {
                trace!(worker_id = id, "Worker stopping");
                return;
            }

            for _ in 0..BATCH_SIZE {
                if trial_value(job.crypto.as_ref(), nonce, &job.initial_hash) <= job.target {
                    hash_count.fetch_add(1, Ordering::Relaxed);
                    if !found.swap(true, Ordering::AcqRel) {
                        // Receiver only goes away once the search returned.
                        let _ = result_tx.send(nonce);
                    }
                    return;
                }
                hash_count.fetch_add(1, Ordering::Relaxed);
                nonce = match nonce.checked_add(job.stride) {
                    Some(next) => next,
                    None => {
                        debug!(worker_id = id, "Residue class exhausted");
                        return;
                    }
                };
            }
        }
    }
}

/// Pool of search threads, spawned afresh for every search.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Pool with an explicit worker count, capped at [`MAX_WORKERS`].
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.min(MAX_WORKERS),
        }
    }

    /// One worker per available compute unit.
    pub fn with_available_parallelism() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(0);
        Self::new(workers)
    }

    /// Number of workers used per search.
    pub fn num_workers(&self) -> usize {
        self.workers
    }

    /// Find a nonce whose trial value does not exceed `target`. Blocks the
    /// calling thread until a worker succeeds or `cancel` fires.
    pub fn search(
        &self,
        crypto: Arc<dyn Cryptography>,
        initial_hash: [u8; HASH_SIZE],
        target: u64,
        cancel: &CancelHandle,
    ) -> PowResult<u64> {
        if self.workers == 0 {
            return Err(PowError::NoComputeUnits);
        }

        let started = Instant::now();
        let job = Arc::new(SearchJob {
            crypto,
            initial_hash,
            target,
            stride: self.workers as u64,
        });
        let found = Arc::new(AtomicBool::new(false));
        let hash_count = Arc::new(AtomicU64::new(0));
        let (result_tx, result_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            match SearchWorker::spawn(
                id,
                Arc::clone(&job),
                Arc::clone(&found),
                cancel.clone(),
                Arc::clone(&hash_count),
                result_tx.clone(),
            ) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    found.store(true, Ordering::Relaxed);
                    Self::join_all(workers);
                    return Err(e);
                }
            }
        }
        drop(result_tx);

        // Every sender is owned by a worker, so this returns once one of
        // them reports a nonce or all of them have stopped.
        let outcome = result_rx.recv();
        found.store(true, Ordering::Relaxed);
        let panicked = Self::join_all(workers);

        let hashes = hash_count.load(Ordering::Relaxed);
        match outcome {
            Ok(nonce) => {
                info!(
                    nonce,
                    hashes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Proof-of-work found"
                );
                Ok(nonce)
            }
            Err(_) if panicked => Err(PowError::WorkerPanicked),
            Err(_) if cancel.is_cancelled() => {
                debug!(hashes, "Proof-of-work cancelled");
                Err(PowError::Cancelled)
            }
            Err(_) => Err(PowError::Exhausted),
        }
    }

    /// Join every worker. Returns whether any of them panicked.
    fn join_all(workers: Vec<SearchWorker>) -> bool {
        let mut panicked = false;
        for worker in workers {
            if worker.handle.join().is_err() {
                warn!(worker_id = worker.id, "Proof-of-work worker panicked");
                panicked = true;
            }
        }
        panicked
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::with_available_parallelism()
    }
}
