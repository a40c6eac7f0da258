//! Load guard: sheds blob-store work when the scheduler is saturated.
//!
//! A background task repeatedly sleeps for a fixed interval and measures how
//! far past the deadline it wakes up. That overshoot is scheduler lag: when
//! the runtime is saturated with work, timers fire late. The guard keeps an
//! exponentially-weighted average of the lag in an atomic so that `admit` is
//! a constant-time read with no I/O and no queuing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// EWMA weight: new = (old * 7 + sample) / 8.
const EWMA_OLD_WEIGHT: u64 = 7;
const EWMA_DIVISOR: u64 = 8;

/// Go/no-go admission check consulted before any blob-store call.
///
/// Fail-open: until the sampler has produced a measurement, `admit` returns
/// true. A missed sample costs bounded queuing, not data loss.
#[derive(Clone)]
pub struct LoadGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    /// EWMA of scheduler lag in microseconds.
    lag_micros: AtomicU64,
    threshold_micros: u64,
}

impl LoadGuard {
    pub fn new(threshold: Duration) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                lag_micros: AtomicU64::new(0),
                threshold_micros: threshold.as_micros() as u64,
            }),
        }
    }

    /// Returns false when the rolling lag sample exceeds the threshold.
    /// Constant time, never suspends, never errors.
    pub fn admit(&self) -> bool {
        self.inner.lag_micros.load(Ordering::Relaxed) <= self.inner.threshold_micros
    }

    /// Current rolling lag estimate.
    pub fn current_lag(&self) -> Duration {
        Duration::from_micros(self.inner.lag_micros.load(Ordering::Relaxed))
    }

    /// Fold a lag sample into the rolling average. Called by the sampler
    /// task; public so tests can drive the guard without timers.
    pub fn record_lag(&self, lag: Duration) {
        let sample = lag.as_micros() as u64;
        let old = self.inner.lag_micros.load(Ordering::Relaxed);
        let next = (old * EWMA_OLD_WEIGHT + sample) / EWMA_DIVISOR;
        self.inner.lag_micros.store(next, Ordering::Relaxed);
    }

    /// Spawn the background sampler. Sleeps `interval` and records how late
    /// the wakeup was relative to the deadline.
    pub fn spawn_sampler(&self, interval: Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = Instant::now() + interval;
                tokio::time::sleep(interval).await;
                let lag = Instant::now().saturating_duration_since(deadline);
                guard.record_lag(lag);
                metrics::gauge!("beats.load_guard.lag_micros")
                    .set(guard.current_lag().as_micros() as f64);
            }
        })
    }
}
