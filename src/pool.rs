//! Worker Pool
//!
//! Runs one long-lived task per admitted connection and tracks how many are
//! active. With a bound configured the accept loop consults
//! [`WorkerPool::is_saturated`] before admitting; without one, tasks are
//! spawned on demand and nothing is ever rejected.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;

/// Pool of connection worker tasks
#[derive(Debug)]
pub struct WorkerPool {
    bound: usize,
    active: Arc<AtomicUsize>,
    peak: AtomicUsize,
    total_submitted: AtomicUsize,
    accepting: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

/// Pool usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active_workers: usize,
    pub peak_workers: usize,
    pub total_submitted: usize,
    pub worker_bound: usize,
}

impl WorkerPool {
    /// Create a pool; `bound == 0` means unbounded
    pub fn new(bound: usize) -> Self {
        Self {
            bound,
            active: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            total_submitted: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Number of submitted tasks that have not finished yet
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// True when a bound is set and every slot is taken
    pub fn is_saturated(&self) -> bool {
        self.bound > 0 && self.active_count() >= self.bound
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Spawn a worker task.
    ///
    /// The active count rises before this returns, so the next admission
    /// check already sees the new worker.
    pub fn submit<F>(&self, task: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(ServerError::PoolShutdown);
        }

        let slot = WorkerSlot::acquire(Arc::clone(&self.active));
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(slot.active_at_acquire, Ordering::Relaxed);

        let mut tasks = self.lock_tasks();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Connection worker panicked: {}", e);
                }
            }
        }
        tasks.spawn(async move {
            let _slot = slot;
            task.await;
        });

        Ok(())
    }

    /// Stop accepting new work. Running tasks are left alone.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("Worker pool stopped accepting new work ({} active)", self.active_count());
        }
    }

    /// Wait for running workers to finish, aborting whatever is left after
    /// `timeout`. Returns how many workers had to be aborted.
    pub async fn join(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        if tasks.is_empty() {
            return 0;
        }

        debug!("Waiting for {} workers to finish (timeout: {:?})", tasks.len(), timeout);
        let drained = tokio::time::timeout(timeout, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Connection worker panicked: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_ok() {
            debug!("All workers finished");
            return 0;
        }

        let remaining = tasks.len();
        warn!("Shutdown timeout reached with {} workers still running, aborting", remaining);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        remaining
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_workers: self.active_count(),
            peak_workers: self.peak.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            worker_bound: self.bound,
        }
    }
}

/// Occupied worker slot, released when the task ends or unwinds
struct WorkerSlot {
    active: Arc<AtomicUsize>,
    active_at_acquire: usize,
}

impl WorkerSlot {
    fn acquire(active: Arc<AtomicUsize>) -> Self {
        let active_at_acquire = active.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            active,
            active_at_acquire,
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
