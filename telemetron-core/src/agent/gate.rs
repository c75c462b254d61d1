//! Bounded concurrency gate for outbound deliveries

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore with a capacity fixed at construction
///
/// [`acquire`](Self::acquire) waits while every slot is taken. The returned
/// permit frees its slot when dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One occupied slot of a [`ConcurrencyGate`]
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// Create a gate; a capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> GatePermit {
        // the semaphore is owned by the gate and never closed
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => GatePermit { _permit: permit },
            Err(_) => unreachable!("concurrency gate semaphore closed"),
        }
    }
}
