//! Concurrency limiter: bounds simultaneous in-flight blob-store operations.
//!
//! Backed by a fair tokio semaphore, so queued operations are admitted in
//! arrival order (FIFO). The owned permit is the in-flight token: it exists
//! from admission until the operation completes, success or failure, which
//! keeps live tokens at or below the configured ceiling at all times.
//!
//! Overload rejection is deliberately not done here; the caller consults the
//! load guard before scheduling.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::blob_store::StorageError;

/// Snapshot of limiter activity for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Operations currently running.
    pub running: usize,
    /// Operations waiting for a slot.
    pub queued: usize,
    /// Operations completed since startup (success or failure).
    pub completed: u64,
}

#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Configured concurrency ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `op` once a slot is free, suspending the caller while at capacity.
    /// Queued callers are admitted in arrival order.
    pub async fn schedule<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        // The semaphore is never closed; treat closure as a backend fault
        // rather than panicking.
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => {
                return Err(StorageError::Backend(
                    "concurrency limiter closed".to_string(),
                ))
            }
        };

        self.running.fetch_add(1, Ordering::SeqCst);
        let result = op.await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        result
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }
}
