//! Semaphore-backed execution slots for one function.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Caps simultaneously active invocations and tracks how many execution
/// environments have ever been warmed.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    in_flight: AtomicUsize,
    /// Highest concurrency ever reached; doubles as the warm-slot count.
    peak_in_flight: AtomicUsize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_permits: max_concurrent,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot. The slot is held until the permit drops.
    pub async fn acquire(self: &Arc<Self>) -> Result<ExecutionPermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let cold_start = self.update_peak(current);
        Ok(ExecutionPermit {
            _permit: permit,
            limiter: Arc::clone(self),
            cold_start,
        })
    }

    /// Returns true if `current` set a new peak, i.e. the invocation needed a
    /// slot that was never warmed before.
    fn update_peak(&self, current: usize) -> bool {
        let mut peak = self.peak_in_flight.load(Ordering::SeqCst);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(p) => peak = p,
            }
        }
        false
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// One occupied execution slot.
pub struct ExecutionPermit {
    _permit: OwnedSemaphorePermit,
    limiter: Arc<ConcurrencyLimiter>,
    cold_start: bool,
}

impl ExecutionPermit {
    pub fn is_cold_start(&self) -> bool {
        self.cold_start
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
