/// Worker pool module
///
/// Bounded-concurrency executor for feed tasks. A semaphore caps how many
/// submitted tasks run at once; submissions beyond the cap queue until a
/// permit frees up. The pool never kills a running task: harvest timeouts
/// leave the worker running, and stopping work mid-flight is the job of
/// each task's cooperative interrupt flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum PoolError {
    /// The pool stopped accepting submissions.
    Closed,
    /// The task did not produce a result within the harvest deadline. The
    /// underlying worker keeps running.
    Timeout,
    /// The task panicked or was torn down by the runtime.
    Failed(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Closed => write!(f, "worker pool is closed"),
            PoolError::Timeout => write!(f, "task did not complete within the timeout"),
            PoolError::Failed(e) => write!(f, "task failed: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

/// Handle to one submitted task.
pub struct TaskHandle<T> {
    join: JoinHandle<T>,
    canceled: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    /// Best-effort cancellation: guaranteed to keep a task that has not yet
    /// acquired a permit from running at all. For a task already running it
    /// is advisory only and must be paired with the task's own interrupt
    /// flag to have real effect.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(size)),
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            size,
        }
    }

    /// Pool sized as a multiple of the machine's available parallelism.
    pub fn with_cpu_multiple(multiplier: usize) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cpus * multiplier.max(1))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently executing (queued submissions are not counted).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Schedule a task; returns immediately. Fails once the pool is closed.
    pub fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + Default + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let canceled = Arc::new(AtomicBool::new(false));
        let canceled_inner = canceled.clone();

        let join = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                // Pool closed while this task was still queued.
                Err(_) => return T::default(),
            };
            if canceled_inner.load(Ordering::SeqCst) {
                return T::default();
            }
            active.fetch_add(1, Ordering::SeqCst);
            let out = fut.await;
            active.fetch_sub(1, Ordering::SeqCst);
            out
        });

        Ok(TaskHandle { join, canceled })
    }

    /// Block up to `timeout` for the task's result. On timeout the worker
    /// is left running; only the task's interrupt flag can actually stop
    /// it, so a delivery already in flight may still complete and mutate
    /// persisted state after the caller has moved on.
    pub async fn await_result<T>(
        &self,
        handle: &mut TaskHandle<T>,
        timeout: Duration,
    ) -> Result<T, PoolError> {
        match tokio::time::timeout(timeout, &mut handle.join).await {
            Err(_) => Err(PoolError::Timeout),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_error)) => Err(PoolError::Failed(join_error.to_string())),
        }
    }

    /// Stop accepting submissions and release queued tasks without running
    /// them. In-flight tasks continue to completion or interruption.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
