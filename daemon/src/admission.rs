//! Admission control.
//!
//! At most `max_parallel` executions hold a permit at any instant. By
//! default everyone else waits for as long as it takes; with a queue
//! limit configured, requests arriving to a full queue are turned away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Server busy: {waiting} requests already waiting for an execution slot")]
    QueueFull { waiting: usize },

    #[error("Admission controller is shut down")]
    Closed,
}

/// Bounds the number of in-flight executions.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    max_queued: Option<usize>,
    waiting: AtomicUsize,
}

/// One admission slot. Capacity is returned when this is dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Keeps the waiting counter honest even if the acquiring future is
/// dropped mid-wait.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_parallel)),
            capacity: config.max_parallel,
            max_queued: config.max_queued,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot.
    ///
    /// Without a queue limit this never fails while the controller is
    /// alive; it simply waits.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(AdmissionPermit { _permit: permit }),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitingGuard(&self.waiting);
        if let Some(limit) = self.max_queued {
            if queued >= limit {
                warn!(waiting = queued, limit, "Admission queue full, rejecting request");
                return Err(AdmissionError::QueueFull { waiting: queued });
            }
        }

        debug!(position = queued + 1, "Waiting for execution slot");
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Stop admitting. Waiting and future callers get [`AdmissionError::Closed`];
    /// permits already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
        debug!(waiting = self.waiting(), "Admission closed");
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Number of requests waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    fn controller(max_parallel: usize, max_queued: Option<usize>) -> AdmissionController {
        AdmissionController::new(&AdmissionConfig {
            max_parallel,
            max_queued,
        })
    }

    #[tokio::test]
    async fn blocks_until_a_slot_is_released() {
        let admission = controller(2, None);
        let first = admission.acquire().await.unwrap();
        let _second = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);

        let mut third = task::spawn(admission.acquire());
        assert_pending!(third.poll());
        assert_eq!(admission.waiting(), 1);

        drop(first);
        assert!(third.is_woken());
        let _permit = assert_ready_ok!(third.poll());
        assert_eq!(admission.waiting(), 0);
        assert_eq!(admission.in_flight(), 2);
    }

    #[tokio::test]
    async fn unbounded_queue_never_rejects() {
        let admission = controller(1, None);
        let _held = admission.acquire().await.unwrap();

        let mut waiters: Vec<_> = (0..50).map(|_| task::spawn(admission.acquire())).collect();
        for waiter in &mut waiters {
            assert_pending!(waiter.poll());
        }
        assert_eq!(admission.waiting(), 50);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full() {
        let admission = controller(1, Some(1));
        let _held = admission.acquire().await.unwrap();

        let mut queued = task::spawn(admission.acquire());
        assert_pending!(queued.poll());

        let err = admission.acquire().await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull { waiting: 1 });
        // The rejected request does not linger in the queue count
        assert_eq!(admission.waiting(), 1);
    }

    #[tokio::test]
    async fn zero_queue_rejects_immediately_when_saturated() {
        let admission = controller(1, Some(0));
        let held = admission.acquire().await.unwrap();
        assert!(admission.acquire().await.is_err());

        drop(held);
        assert!(admission.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_queue() {
        let admission = controller(1, None);
        let _held = admission.acquire().await.unwrap();

        let mut waiter = task::spawn(admission.acquire());
        assert_pending!(waiter.poll());
        assert_eq!(admission.waiting(), 1);

        drop(waiter);
        assert_eq!(admission.waiting(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_newcomers() {
        let admission = controller(1, None);
        let held = admission.acquire().await.unwrap();

        let mut waiter = task::spawn(admission.acquire());
        assert_pending!(waiter.poll());

        admission.close();
        assert!(waiter.is_woken());
        assert_eq!(assert_ready_err!(waiter.poll()), AdmissionError::Closed);
        drop(waiter);
        assert_eq!(admission.waiting(), 0);

        // The permit held across close is still released normally
        drop(held);
        assert_eq!(admission.acquire().await.unwrap_err(), AdmissionError::Closed);
    }
}
