//! Injected runtime resources: clocks, the worker pool and timer scheduling.
//!
//! Nothing in here is global. A server owns one set of these and hands
//! `Arc`s down to every connection, stream and shared object.

pub mod clock;
pub mod executor;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{Completion, Executor, InlineExecutor, WorkerPool};
pub use scheduler::{JobHandle, ManualScheduler, Scheduler, ThreadScheduler};
