// src/util/scheduler.rs - Timer scheduling
//
// Core features:
// - `Scheduler` trait: schedule once, schedule repeating, cancel
// - `ThreadScheduler`: one timer thread, due jobs run on the worker pool
// - `ManualScheduler`: clock driven, runs due jobs on the caller thread
//
// Cancellation is best effort: a job already handed to the pool still runs,
// owners re-check their own state before acting.

use crate::error::{Error, Result};
use crate::util::clock::{Clock, ManualClock};
use crate::util::executor::Executor;
use crossbeam_channel::{RecvTimeoutError, Sender};
use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type OnceJob = Box<dyn FnOnce() + Send + 'static>;
pub type RepeatingJob = Arc<dyn Fn() + Send + Sync + 'static>;

/// Identifies a scheduled job for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

pub trait Scheduler: Send + Sync {
    /// Runs `job` once after `delay` milliseconds.
    fn schedule_once(&self, delay: u64, job: OnceJob) -> JobHandle;

    /// Runs `job` after `initial_delay`, then every `interval` milliseconds.
    fn schedule_repeating(&self, initial_delay: u64, interval: u64, job: RepeatingJob) -> JobHandle;

    /// Returns `true` when the job was still scheduled.
    fn cancel(&self, handle: JobHandle) -> bool;
}

enum TimerJob {
    Once(OnceJob),
    Repeating(RepeatingJob),
}

// ============================================================================
// Thread Scheduler
// ============================================================================

struct TimerEntry {
    due: Instant,
    interval: Option<Duration>,
    // boxed once jobs are `Send` only, the mutex makes the shared map `Sync`
    job: Mutex<TimerJob>,
}

enum TimerCommand {
    Wake { id: u64, due: Instant },
    Shutdown,
}

pub struct ThreadScheduler {
    jobs: Arc<DashMap<u64, TimerEntry>>,
    next_id: AtomicU64,
    commands: Mutex<Option<Sender<TimerCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Starts the timer thread. Due jobs are handed to `executor`.
    pub fn new(executor: Arc<dyn Executor>) -> Result<Self> {
        let jobs: Arc<DashMap<u64, TimerEntry>> = Arc::new(DashMap::new());
        let (sender, receiver) = crossbeam_channel::unbounded();
        let timer_jobs = jobs.clone();
        let result = std::thread::Builder::new()
            .name("rtmp-scheduler".to_string())
            .spawn(move || {
                let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
                loop {
                    let command = match heap.peek() {
                        Some(Reverse((due, _))) => {
                            let timeout = due.saturating_duration_since(Instant::now());
                            receiver.recv_timeout(timeout)
                        }
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match command {
                        Ok(TimerCommand::Wake { id, due }) => heap.push(Reverse((due, id))),
                        Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    fire_due(&timer_jobs, &mut heap, executor.as_ref());
                }
                debug!("Scheduler thread stopped");
            });
        let thread = match result {
            Ok(thread) => thread,
            Err(e) => {
                error!("Thread[rtmp-scheduler] exited with error: {e}");
                return Err(Error::ThreadExited);
            }
        };
        Ok(Self {
            jobs,
            next_id: AtomicU64::new(1),
            commands: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn insert(&self, delay: u64, interval: Option<u64>, job: TimerJob) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + Duration::from_millis(delay);
        self.jobs.insert(
            id,
            TimerEntry {
                due,
                interval: interval.map(|ms| Duration::from_millis(ms.max(1))),
                job: Mutex::new(job),
            },
        );
        let sent = match self.commands.lock().as_ref() {
            Some(sender) => sender.send(TimerCommand::Wake { id, due }).is_ok(),
            None => false,
        };
        if !sent {
            warn!("Scheduler is shut down, job {id} will never run");
            self.jobs.remove(&id);
        }
        JobHandle(id)
    }

    /// Stops the timer thread and drops every pending job.
    pub fn shutdown(&self) {
        if let Some(sender) = self.commands.lock().take() {
            let _ = sender.send(TimerCommand::Shutdown);
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
        self.jobs.clear();
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }
}

fn fire_due(
    jobs: &DashMap<u64, TimerEntry>,
    heap: &mut BinaryHeap<Reverse<(Instant, u64)>>,
    executor: &dyn Executor,
) {
    let now = Instant::now();
    while let Some(Reverse((due, id))) = heap.peek().copied() {
        if due > now {
            break;
        }
        heap.pop();
        let repeating = match jobs.get_mut(&id) {
            // cancelled
            None => continue,
            Some(mut entry) => {
                if entry.due != due {
                    continue;
                }
                let repeating = match (&*entry.job.lock(), entry.interval) {
                    (TimerJob::Repeating(job), Some(interval)) => Some((job.clone(), interval)),
                    _ => None,
                };
                match repeating {
                    Some((job, interval)) => {
                        entry.due = due + interval;
                        heap.push(Reverse((due + interval, id)));
                        Some(job)
                    }
                    None => None,
                }
            }
        };
        let result = match repeating {
            Some(job) => executor.execute(Box::new(move || job())),
            None => match jobs.remove(&id).map(|(_, entry)| entry.job.into_inner()) {
                Some(TimerJob::Once(job)) => executor.execute(job),
                Some(TimerJob::Repeating(job)) => executor.execute(Box::new(move || job())),
                None => continue,
            },
        };
        if let Err(e) = result {
            warn!("Scheduled job {id} could not be dispatched: {e}");
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_once(&self, delay: u64, job: OnceJob) -> JobHandle {
        self.insert(delay, None, TimerJob::Once(job))
    }

    fn schedule_repeating(&self, initial_delay: u64, interval: u64, job: RepeatingJob) -> JobHandle {
        self.insert(initial_delay, Some(interval), TimerJob::Repeating(job))
    }

    fn cancel(&self, handle: JobHandle) -> bool {
        self.jobs.remove(&handle.0).is_some()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Manual Scheduler
// ============================================================================

struct ManualEntry {
    due: u64,
    interval: Option<u64>,
    job: TimerJob,
}

/// Deterministic scheduler driven by a [`ManualClock`].
///
/// Jobs run synchronously inside [`advance`](ManualScheduler::advance), in due
/// order, with the clock set to each job's due time. No lock is held while a
/// job runs, so jobs may schedule or cancel freely.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    jobs: Mutex<BTreeMap<u64, ManualEntry>>,
    next_id: AtomicU64,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Moves the clock forward by `millis`, running every job that falls due.
    pub fn advance(&self, millis: u64) {
        let target = self.clock.now_millis() + millis;
        loop {
            let next = {
                let mut jobs = self.jobs.lock();
                let candidate = jobs
                    .iter()
                    .filter(|(_, entry)| entry.due <= target)
                    .min_by_key(|(id, entry)| (entry.due, **id))
                    .map(|(id, _)| *id);
                match candidate {
                    None => None,
                    Some(id) => {
                        let repeating = match jobs.get_mut(&id) {
                            Some(entry) => match (&entry.job, entry.interval) {
                                (TimerJob::Repeating(job), Some(interval)) => {
                                    let job = job.clone();
                                    let due = entry.due;
                                    entry.due += interval.max(1);
                                    Some((due, job))
                                }
                                _ => None,
                            },
                            None => None,
                        };
                        match repeating {
                            Some((due, job)) => Some((due, TimerJob::Repeating(job))),
                            None => jobs.remove(&id).map(|entry| (entry.due, entry.job)),
                        }
                    }
                }
            };
            let (due, job) = match next {
                Some(next) => next,
                None => break,
            };
            if due > self.clock.now_millis() {
                self.clock.set(due);
            }
            match job {
                TimerJob::Once(job) => job(),
                TimerJob::Repeating(job) => job(),
            }
        }
        if target > self.clock.now_millis() {
            self.clock.set(target);
        }
    }

    /// Runs whatever is due right now.
    pub fn run_pending(&self) {
        self.advance(0);
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_scheduled(&self, handle: JobHandle) -> bool {
        self.jobs.lock().contains_key(&handle.0)
    }

    fn insert(&self, delay: u64, interval: Option<u64>, job: TimerJob) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = self.clock.now_millis() + delay;
        self.jobs.lock().insert(id, ManualEntry { due, interval, job });
        JobHandle(id)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: u64, job: OnceJob) -> JobHandle {
        self.insert(delay, None, TimerJob::Once(job))
    }

    fn schedule_repeating(&self, initial_delay: u64, interval: u64, job: RepeatingJob) -> JobHandle {
        self.insert(initial_delay, Some(interval), TimerJob::Repeating(job))
    }

    fn cancel(&self, handle: JobHandle) -> bool {
        self.jobs.lock().remove(&handle.0).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::executor::{InlineExecutor, WorkerPool};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_manual_once_and_repeating() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(clock.clone());
        let once = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));

        let o = once.clone();
        scheduler.schedule_once(100, Box::new(move || {
            o.fetch_add(1, Ordering::SeqCst);
        }));
        let t = ticks.clone();
        let handle = scheduler.schedule_repeating(10, 10, Arc::new(move || {
            t.fetch_add(1, Ordering::SeqCst);
        }));

        scheduler.advance(99);
        assert_eq!(once.load(Ordering::SeqCst), 0);
        assert_eq!(ticks.load(Ordering::SeqCst), 9);

        scheduler.advance(1);
        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), 10);
        assert_eq!(clock.now_millis(), 100);

        assert!(scheduler.cancel(handle));
        assert!(!scheduler.cancel(handle));
        scheduler.advance(1000);
        assert_eq!(ticks.load(Ordering::SeqCst), 10);
        assert_eq!(scheduler.pending_jobs(), 0);
    }

    #[test]
    fn test_manual_job_sees_its_due_time() {
        let clock = Arc::new(ManualClock::new(5));
        let scheduler = ManualScheduler::new(clock.clone());
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let c = clock.clone();
        scheduler.schedule_once(20, Box::new(move || {
            s.store(c.now_millis(), Ordering::SeqCst);
        }));
        scheduler.advance(1000);
        assert_eq!(seen.load(Ordering::SeqCst), 25);
        assert_eq!(clock.now_millis(), 1005);
    }

    #[test]
    fn test_manual_job_can_cancel_itself() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(ManualScheduler::new(clock));
        let handle_slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
        let runs = Arc::new(AtomicUsize::new(0));

        let sched = scheduler.clone();
        let slot = handle_slot.clone();
        let r = runs.clone();
        let handle = scheduler.schedule_repeating(10, 10, Arc::new(move || {
            if r.fetch_add(1, Ordering::SeqCst) == 2 {
                if let Some(handle) = *slot.lock() {
                    sched.cancel(handle);
                }
            }
        }));
        *handle_slot.lock() = Some(handle);
        scheduler.advance(200);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_thread_scheduler_runs_and_cancels() {
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let scheduler = ThreadScheduler::new(executor).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        scheduler.schedule_once(5, Box::new(move || {
            let _ = tx.send(1);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let handle = scheduler.schedule_once(10_000, Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(scheduler.cancel(handle));
        assert_eq!(scheduler.pending_jobs(), 0);
        scheduler.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    fn assert_send_sync<T: Send + Sync + ?Sized>() {}

    #[test]
    fn test_thread_scheduler_shared_between_threads() {
        assert_send_sync::<ThreadScheduler>();
        let pool = Arc::new(WorkerPool::new("sched-shared", 1).unwrap());
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler::new(pool.clone()).unwrap());
        let (tx, rx) = crossbeam_channel::unbounded();
        let remote = scheduler.clone();
        std::thread::spawn(move || {
            remote.schedule_once(1, Box::new(move || {
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }));
        })
        .join()
        .unwrap();
        let fired_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired_on.is_some_and(|name| name.starts_with("sched-shared")));
        drop(scheduler);
        pool.shutdown();
    }

    #[test]
    fn test_thread_scheduler_repeats_on_pool() {
        let pool: Arc<dyn Executor> = Arc::new(WorkerPool::new("sched-test", 2).unwrap());
        let scheduler = ThreadScheduler::new(pool).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = scheduler.schedule_repeating(1, 2, Arc::new(move || {
            let _ = tx.send(());
        }));
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(scheduler.cancel(handle));
        scheduler.shutdown();
    }
}
