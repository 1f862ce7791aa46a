//! Global admission control for in-flight replay work
//!
//! Bounds how many reconstructed requests may be in flight across all
//! sessions at once. Permits are RAII guards; shutdown closes the semaphore
//! so every queued acquisition completes exceptionally instead of hanging.

use crate::error::{ReplayError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting gate over concurrently admitted units of replay work.
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    admitted_total: AtomicU64,
    rejected_on_shutdown: AtomicU64,
}

impl AdmissionLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            admitted_total: AtomicU64::new(0),
            rejected_on_shutdown: AtomicU64::new(0),
        }
    }

    /// Wait for an admission slot. Fails with `ShuttingDown` once the
    /// limiter has been closed.
    pub async fn admit(&self) -> Result<AdmissionPermit> {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => {
                self.admitted_total.fetch_add(1, Ordering::Relaxed);
                Ok(AdmissionPermit { _permit: permit })
            }
            Err(_) => {
                self.rejected_on_shutdown.fetch_add(1, Ordering::Relaxed);
                Err(ReplayError::ShuttingDown)
            }
        }
    }

    /// Close the gate: queued and future admissions fail immediately.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(Ordering::Relaxed)
    }
}

/// RAII admission slot; dropping it releases the slot.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_bound_in_flight_work() {
        let limiter = Arc::new(AdmissionLimiter::new(2));
        let p1 = limiter.admit().await.unwrap();
        let _p2 = limiter.admit().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        // A third admission waits until a slot frees up.
        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(p1);
        let p3 = waiting.await.unwrap().unwrap();
        assert_eq!(limiter.in_flight(), 2);
        drop(p3);
        assert_eq!(limiter.admitted_total(), 3);
    }

    #[tokio::test]
    async fn test_close_drains_waiters_exceptionally() {
        let limiter = Arc::new(AdmissionLimiter::new(1));
        let _held = limiter.admit().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        limiter.close();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(ReplayError::ShuttingDown)));
        assert!(matches!(
            limiter.admit().await,
            Err(ReplayError::ShuttingDown)
        ));
    }
}
