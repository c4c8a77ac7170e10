use futures_util::FutureExt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

/// A fixed number of slots to run message processing tasks in.
///
/// At most `capacity` tasks are in flight at any time: [`WorkerPool::acquire`] waits
/// until a slot frees up, which is what applies backpressure to the broker subscription.
pub struct WorkerPool<T> {
    slots: Arc<Semaphore>,
    capacity: usize,
    workers: JoinSet<T>,
}

/// The right to run one task in a [`WorkerPool`].
///
/// The slot is given back to the pool when dropped, whether the task completed or panicked.
#[must_use]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity.get())),
            capacity: capacity.get(),
            workers: JoinSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many slots are currently taken.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// `true` if no task is waiting to be reaped.
    pub fn is_idle(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<WorkerSlot, AcquireError> {
        let permit = Arc::clone(&self.slots).acquire_owned().await?;
        Ok(WorkerSlot { _permit: permit })
    }

    /// Run `work` in the background, holding `slot` until it completes.
    pub fn spawn<F>(&mut self, slot: WorkerSlot, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.workers.spawn(async move {
            let _slot = slot;
            work.await
        });
    }

    /// Reap the next completed task.
    ///
    /// Returns `None` if there are no tasks in the pool.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.workers.join_next().await
    }

    /// Reap the tasks that already completed, without waiting for the others.
    pub fn reap(&mut self) -> Vec<T> {
        let mut outcomes = Vec::new();
        while let Some(Some(joined)) = self.workers.join_next().now_or_never() {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = ?e, "A worker task did not complete"),
            }
        }
        outcomes
    }

    /// Wait for every in-flight task to complete.
    pub async fn drain(&mut self) -> Vec<T> {
        if !self.workers.is_empty() {
            info!(
                in_flight = self.workers.len(),
                "Waiting for in-flight workers to complete"
            );
        }
        let mut outcomes = Vec::with_capacity(self.workers.len());
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = ?e, "A worker task did not complete"),
            }
        }
        outcomes
    }
}
