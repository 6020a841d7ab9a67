//! Named, concurrency-bounded queues (spec.md §4.4, §5 "Backpressure").
//!
//! Each named queue owns a [`Semaphore`] capping how many of its jobs run at
//! once, and a pending counter enforcing a soft cap so a burst of submissions
//! fails fast with [`CoreError::QueueFull`] instead of growing unbounded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use scan_core::{CoreError, CoreResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default soft cap on pending items per named queue (spec.md §5).
pub const DEFAULT_SOFT_CAP: usize = 1000;

pub struct NamedQueue {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    soft_cap: usize,
}

/// Holds a queue's "this item is in flight" accounting. Dropping it (on
/// success, failure, or panic) returns the slot to the queue.
pub struct QueueTicket {
    pending: Arc<AtomicUsize>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NamedQueue {
    #[must_use]
    pub fn new(name: &'static str, concurrency: usize, soft_cap: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            soft_cap,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Reserve a pending slot. Must be called before awaiting a concurrency
    /// permit so the soft cap accounts for queued-but-not-yet-running work.
    ///
    /// # Errors
    /// Returns [`CoreError::QueueFull`] if the queue is already at its soft
    /// cap.
    pub fn try_reserve(&self) -> CoreResult<QueueTicket> {
        let prev = self.pending.fetch_add(1, Ordering::SeqCst);
        if prev >= self.soft_cap {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::QueueFull(self.name.to_string()));
        }
        Ok(QueueTicket { pending: Arc::clone(&self.pending) })
    }

    /// Await a concurrency permit. Held for the lifetime of one task's
    /// execution; dropping it frees the slot for the next queued item.
    pub async fn acquire_slot(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_past_soft_cap_is_queue_full() {
        let queue = NamedQueue::new("scans", 2, 1);
        let _first = queue.try_reserve().unwrap();
        let err = queue.try_reserve().unwrap_err();
        assert!(matches!(err, CoreError::QueueFull(name) if name == "scans"));
    }

    #[test]
    fn dropping_a_ticket_frees_the_slot() {
        let queue = NamedQueue::new("scans", 2, 1);
        {
            let _ticket = queue.try_reserve().unwrap();
            assert_eq!(queue.pending(), 1);
        }
        assert_eq!(queue.pending(), 0);
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn acquire_slot_bounds_concurrency() {
        let queue = NamedQueue::new("generate", 1, DEFAULT_SOFT_CAP);
        let permit = queue.acquire_slot().await;
        assert_eq!(queue.semaphore.available_permits(), 0);
        drop(permit);
        assert_eq!(queue.semaphore.available_permits(), 1);
    }
}
