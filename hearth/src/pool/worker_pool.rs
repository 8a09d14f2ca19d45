use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::worker::run_worker;
use super::{TaskHandler, ThreadPoolInfo};
use crate::error::PoolError;

/// Queue and counters, guarded together by one mutex.
pub(super) struct PoolState<T> {
    pub(super) queue: VecDeque<T>,
    pub(super) info: ThreadPoolInfo,
    /// Bumped on every stop so workers from an earlier start never pick up
    /// tasks queued after a restart.
    pub(super) generation: u64,
}

/// State shared between the pool handle and its worker threads.
pub(super) struct Shared<T> {
    pub(super) name: String,
    pub(super) state: Mutex<PoolState<T>>,
    pub(super) condvar: Condvar,
    pub(super) handler: Arc<dyn TaskHandler<T>>,
}

impl<T> Shared<T> {
    /// Lock the state. Handlers never run under this lock, so a poisoned
    /// mutex still holds consistent data.
    pub(super) fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size thread pool with a bounded FIFO task queue.
///
/// # Lifecycle
/// 1. [`start`](Self::start) spawns the workers; each runs the init hook once
/// 2. [`add_task`](Self::add_task) enqueues without blocking
/// 3. [`stop`](Self::stop) refuses new tasks and wakes every worker; queued
///    tasks are dropped unprocessed
/// 4. [`join`](Self::join) waits for the workers to exit; tasks already
///    running finish naturally
///
/// Dropping the pool performs `stop` followed by `join`.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("info", &self.info())
            .finish()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a stopped pool.
    ///
    /// # Arguments
    /// * `name` - Pool name, used for thread names and logging
    /// * `threads` - Number of worker threads spawned by `start`
    /// * `queue_capacity` - Maximum number of queued tasks
    /// * `handler` - Invoked by a worker for every dequeued task
    pub fn new<F>(name: impl Into<String>, threads: usize, queue_capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_shared_handler(name, threads, queue_capacity, Arc::new(handler))
    }

    /// Same as [`new`](Self::new) for any [`TaskHandler`] behind an `Arc`.
    pub fn with_shared_handler(
        name: impl Into<String>,
        threads: usize,
        queue_capacity: usize,
        handler: Arc<dyn TaskHandler<T>>,
    ) -> Self {
        let info = ThreadPoolInfo {
            thread_count: threads,
            queue_capacity,
            ..ThreadPoolInfo::default()
        };
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(PoolState {
                    queue: VecDeque::with_capacity(queue_capacity.min(1024)),
                    info,
                    generation: 0,
                }),
                condvar: Condvar::new(),
                handler,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the worker threads. A no-op while the pool is already started.
    ///
    /// `init` runs once on every worker thread before it takes its first
    /// task; a panic inside it is logged and the worker carries on.
    pub fn start<F>(&self, init: F) -> Result<(), PoolError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (generation, thread_count) = {
            let mut state = self.shared.lock();
            if state.info.started {
                return Ok(());
            }
            state.info.started = true;
            (state.generation, state.info.thread_count)
        };

        let init = Arc::new(init);
        let mut spawned = Vec::with_capacity(thread_count);
        let mut failure = None;
        for worker_id in 0..thread_count {
            let shared = Arc::clone(&self.shared);
            let init = Arc::clone(&init);
            let result = thread::Builder::new()
                .name(format!("{}-worker-{}", self.shared.name, worker_id))
                .spawn(move || run_worker(shared, generation, worker_id, init.as_ref()));
            match result {
                Ok(handle) => spawned.push(handle),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(spawned);

        if let Some(e) = failure {
            self.stop();
            return Err(PoolError::Spawn {
                pool: self.shared.name.clone(),
                reason: e.to_string(),
            });
        }

        info!(pool = %self.shared.name, threads = thread_count, "Thread pool started");
        Ok(())
    }

    /// Refuse new tasks and wake every waiting worker. Does not wait.
    pub fn stop(&self) {
        let pending = {
            let mut state = self.shared.lock();
            if !state.info.started {
                return;
            }
            state.info.started = false;
            state.generation = state.generation.wrapping_add(1);
            std::mem::take(&mut state.queue)
        };
        self.shared.condvar.notify_all();
        let discarded = pending.len();
        drop(pending);
        if discarded > 0 {
            warn!(pool = %self.shared.name, discarded, "Thread pool stopped with queued tasks");
        } else {
            debug!(pool = %self.shared.name, "Thread pool stopped");
        }
    }

    /// Block until every worker thread has left its loop.
    ///
    /// Call [`stop`](Self::stop) first, otherwise this waits forever.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in handles {
            // A pool dropped from one of its own workers cannot join that worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "Worker thread terminated by panic");
            }
        }
    }

    /// Enqueue a task for the workers.
    ///
    /// # Errors
    /// * `PoolError::NotStarted` - before `start` or after `stop`
    /// * `PoolError::QueueFull` - `queue_capacity` tasks are already waiting
    pub fn add_task(&self, task: T) -> Result<(), PoolError> {
        {
            let mut state = self.shared.lock();
            if !state.info.started {
                return Err(PoolError::NotStarted {
                    pool: self.shared.name.clone(),
                });
            }
            if state.queue.len() >= state.info.queue_capacity {
                return Err(PoolError::QueueFull {
                    pool: self.shared.name.clone(),
                    capacity: state.info.queue_capacity,
                });
            }
            state.queue.push_back(task);
        }
        self.shared.condvar.notify_one();
        Ok(())
    }

    /// Snapshot of the pool counters.
    pub fn info(&self) -> ThreadPoolInfo {
        let state = self.shared.lock();
        let mut info = state.info;
        info.current_queue = state.queue.len();
        info
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock().info.started
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
