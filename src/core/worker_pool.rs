//! Bounded pool that runs message handlers off the broker dispatch path.
//!
//! A fixed number of worker tasks pull jobs from a shared flume channel, so at most
//! `size` handlers run at once no matter how many logical queues feed the pool.
//! Callers reserve a [`WorkerSlot`] before choosing what to run, so work never waits
//! in a backlog behind other work that was picked earlier.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::core::error::QueueError;

pub type Job = BoxFuture<'static, ()>;

/// A worker reserved for one job. Dropping it unused frees the worker again.
#[derive(Debug)]
pub struct WorkerSlot(OwnedSemaphorePermit);

#[derive(Debug, Default)]
struct PoolStats {
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed-size handler pool shared by every logical queue of a messenger.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    tx: flume::Sender<(WorkerSlot, Job)>,
    stats: Arc<PoolStats>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers on the current tokio runtime.
    pub fn new(size: usize) -> Result<Self, QueueError> {
        if size == 0 {
            return Err(QueueError::invalid("worker pool size must be at least 1"));
        }

        let (tx, rx) = flume::unbounded::<(WorkerSlot, Job)>();
        let stats = Arc::new(PoolStats::default());

        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    while let Ok((slot, job)) = rx.recv_async().await {
                        match AssertUnwindSafe(job).catch_unwind().await {
                            Ok(()) => {
                                stats.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                stats.panicked.fetch_add(1, Ordering::Relaxed);
                                error!(target: "priomq::pool", worker = id, "Handler panicked");
                            }
                        }
                        drop(slot);
                    }
                    debug!(target: "priomq::pool", worker = id, "Worker exiting");
                })
            })
            .collect();

        debug!(target: "priomq::pool", size, "Worker pool started");
        Ok(Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            tx,
            stats,
            workers,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers neither running nor reserved for a job.
    #[inline]
    pub fn idle(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.stats.panicked.load(Ordering::Relaxed)
    }

    /// Waits until a worker is free and reserves it.
    pub async fn reserve(&self) -> Result<WorkerSlot, QueueError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map(WorkerSlot)
            .map_err(|_| QueueError::PoolClosed)
    }

    /// Runs `job` on the worker held by `slot`. The worker is released when the job ends.
    pub fn submit(&self, slot: WorkerSlot, job: Job) -> Result<(), QueueError> {
        self.tx
            .send((slot, job))
            .map_err(|_| QueueError::PoolClosed)
    }

    /// Reserves a worker and runs `job` on it.
    pub async fn spawn(&self, job: Job) -> Result<(), QueueError> {
        let slot = self.reserve().await?;
        self.submit(slot, job)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.slots.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}
