// src/util/executor.rs - Shared worker pool
//
// Core features:
// - Fixed set of named worker threads fed by a crossbeam channel
// - Panics inside jobs are contained, the worker keeps running
// - `submit` hands back a completion the caller can block on
// - Inline executor for deterministic tests and embedding

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs, now or later, on some thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job) -> Result<()>;
}

impl<'a> dyn Executor + 'a {
    /// Runs `f` on the executor and returns a handle to its result.
    ///
    /// A panic inside `f` is reported as [`Error::TaskPanicked`].
    pub fn submit<T, F>(&self, f: F) -> Result<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.execute(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|_| Error::TaskPanicked);
            let _ = sender.send(result);
        }))?;
        Ok(Completion { receiver })
    }
}

/// Result of a submitted job.
pub struct Completion<T> {
    receiver: Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Blocks until the job finished.
    pub fn wait(self) -> Result<T> {
        match self.receiver.recv() {
            Ok(result) => result,
            // job dropped unexecuted
            Err(_) => Err(Error::PoolShutdown),
        }
    }

    /// Blocks at most `timeout`; `None` when the job is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Some(Err(Error::PoolShutdown)),
        }
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `threads` workers named `{name}-{index}`.
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{name}-{index}");
            let result = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(receiver));
            match result {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Thread[{thread_name}] exited with error: {e}");
                    return Err(Error::ThreadExited);
                }
            }
        }
        debug!("Worker pool '{name}' started with {} threads", workers.len());
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub fn shutdown(&self) {
        // dropping the sender ends every worker loop once the queue drains
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender.send(job).map_err(|_| Error::PoolShutdown),
            None => Err(Error::PoolShutdown),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                "Job panicked on {}",
                std::thread::current().name().unwrap_or("worker")
            );
        }
    }
}

// ============================================================================
// Inline Executor
// ============================================================================

/// Runs every job on the calling thread before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Inline job panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_submit_returns_value() {
        let pool: Arc<dyn Executor> = Arc::new(WorkerPool::new("test-pool", 2).unwrap());
        let completion = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(completion.wait().unwrap(), 42);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test-panic", 1).unwrap();
        let executor: &dyn Executor = &pool;
        let result = executor.submit(|| panic!("boom")).unwrap().wait();
        assert!(matches!(result, Err(Error::TaskPanicked)));

        // the single worker must still be alive
        let value = executor.submit(|| 7).unwrap().wait().unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let pool = WorkerPool::new("test-shutdown", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.is_shutdown());
        assert!(matches!(pool.execute(Box::new(|| {})), Err(Error::PoolShutdown)));
    }

    #[test]
    fn test_inline_executor_runs_immediately() {
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        executor
            .execute(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(executor.submit(|| "done").unwrap().wait().unwrap(), "done");
    }
}
