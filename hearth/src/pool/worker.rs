//! # Worker Loop
//!
//! Body of every pool thread.
//!
//! ## Core Algorithm
//! 1. Record the outcome of the previous task (busy count, counters)
//! 2. Wait until the queue is non-empty or the pool is stopped
//! 3. Stopped: exit without draining
//! 4. Pop one task, mark busy, release the lock
//! 5. Run the handler, catching errors and panics
//!
//! Steps 1-4 happen under a single acquisition of the pool lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};

use tracing::{error, trace, warn};

use super::worker_pool::Shared;
use crate::error::panic_message;

/// Outcome of one handled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

pub(super) fn run_worker<T: Send + 'static>(
    shared: Arc<Shared<T>>,
    generation: u64,
    worker_id: usize,
    init: &(dyn Fn() + Send + Sync),
) {
    if panic::catch_unwind(AssertUnwindSafe(init)).is_err() {
        warn!(pool = %shared.name, worker = worker_id, "Worker init hook panicked");
    }

    let mut last: Option<Outcome> = None;
    loop {
        let task = {
            let mut state = shared.lock();
            if let Some(outcome) = last.take() {
                state.info.busy_threads -= 1;
                match outcome {
                    Outcome::Completed => state.info.completed_tasks += 1,
                    Outcome::Failed => state.info.failed_tasks += 1,
                }
            }
            let task = loop {
                if !state.info.started || state.generation != generation {
                    trace!(pool = %shared.name, worker = worker_id, "Worker exiting");
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                state = shared
                    .condvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            };
            state.info.busy_threads += 1;
            task
        };

        last = Some(execute(&shared, worker_id, task));
    }
}

fn execute<T: Send + 'static>(shared: &Shared<T>, worker_id: usize, task: T) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| shared.handler.handle_task(task))) {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(e)) => {
            warn!(pool = %shared.name, worker = worker_id, error = %e, "Task failed");
            Outcome::Failed
        }
        Err(panic_error) => {
            let message = panic_message(panic_error.as_ref());
            error!(pool = %shared.name, worker = worker_id, panic = %message, "Task panicked");
            Outcome::Failed
        }
    }
}
