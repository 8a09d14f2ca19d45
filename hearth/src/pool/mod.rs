//! # Worker Pool Module
//!
//! A fixed-size pool of OS threads draining a bounded FIFO task queue.
//!
//! ## Key Concepts
//! - Admission control: `add_task` never blocks; it either enqueues or
//!   fails with `QueueFull` / `NotStarted`
//! - Failure isolation: handler errors and panics are counted, never fatal
//!   to the worker thread
//! - Live accounting: [`ThreadPoolInfo`] snapshots of busy threads, queue
//!   depth and completed/failed counters
//!
//! ## Thread Safety
//! - One mutex guards the queue and the counters together
//! - One condition variable wakes idle workers
//! - Stop does not drain: tasks still queued when `stop` is called are
//!   discarded

mod worker;
mod worker_pool;

use serde::Serialize;

pub use worker_pool::WorkerPool;

/// Work executed by pool threads for every dequeued task.
///
/// Any closure `Fn(T) -> anyhow::Result<()>` qualifies.
pub trait TaskHandler<T>: Send + Sync + 'static {
    fn handle_task(&self, task: T) -> anyhow::Result<()>;
}

impl<T, F> TaskHandler<T> for F
where
    F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle_task(&self, task: T) -> anyhow::Result<()> {
        self(task)
    }
}

/// Point-in-time view of a pool, copied under the pool lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadPoolInfo {
    /// Whether the pool currently accepts tasks
    pub started: bool,

    /// Configured number of worker threads
    pub thread_count: usize,

    /// Configured maximum queue length
    pub queue_capacity: usize,

    /// Workers currently running a task
    pub busy_threads: usize,

    /// Tasks waiting in the queue
    pub current_queue: usize,

    /// Tasks whose handler returned `Ok`
    pub completed_tasks: u64,

    /// Tasks whose handler returned an error or panicked
    pub failed_tasks: u64,
}
