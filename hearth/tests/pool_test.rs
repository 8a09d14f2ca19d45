// Integration tests for hearth::pool::WorkerPool

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::wait_until;
use hearth::{PoolError, WorkerPool};

const WAIT: Duration = Duration::from_secs(5);

/// Pool whose single worker blocks on `gate` for every task.
fn gated_pool(capacity: usize) -> (WorkerPool<u32>, flume::Sender<()>, Arc<Mutex<Vec<u32>>>) {
    let (gate_tx, gate_rx) = flume::unbounded::<()>();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&handled);
    let pool = WorkerPool::new("gated", 1, capacity, move |task: u32| {
        gate_rx.recv()?;
        seen.lock().unwrap().push(task);
        Ok(())
    });
    (pool, gate_tx, handled)
}

#[test]
fn test_end_to_end_counts_every_task() {
    let pool = WorkerPool::new("e2e", 2, 4, |task: u32| {
        thread::sleep(Duration::from_millis(2));
        if task % 5 == 0 {
            anyhow::bail!("task {} rejected", task);
        }
        Ok(())
    });
    pool.start(|| {}).unwrap();

    for task in 0..10u32 {
        loop {
            match pool.add_task(task) {
                Ok(()) => break,
                Err(PoolError::QueueFull { capacity, .. }) => {
                    assert_eq!(capacity, 4);
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(pool.info().current_queue <= 4);
    }

    assert!(wait_until(WAIT, || {
        let info = pool.info();
        info.completed_tasks + info.failed_tasks == 10
    }));
    pool.stop();
    pool.join();

    let info = pool.info();
    assert!(!info.started);
    assert_eq!(info.thread_count, 2);
    assert_eq!(info.completed_tasks, 8);
    assert_eq!(info.failed_tasks, 2);
    assert_eq!(info.busy_threads, 0);
    assert_eq!(info.current_queue, 0);
}

#[test]
fn test_add_task_requires_started_pool() {
    let pool = WorkerPool::new("lifecycle", 1, 2, |_: u32| Ok(()));
    assert!(matches!(pool.add_task(1), Err(PoolError::NotStarted { .. })));

    pool.start(|| {}).unwrap();
    pool.add_task(1).unwrap();
    pool.stop();

    let error = pool.add_task(2).unwrap_err();
    assert_eq!(error, PoolError::NotStarted { pool: "lifecycle".into() });
    assert!(error.is_recoverable());
    pool.join();
}

#[test]
fn test_queue_full_at_capacity_plus_one() {
    let capacity = 3;
    let (pool, gate, handled) = gated_pool(capacity);
    pool.start(|| {}).unwrap();

    // Occupy the only worker so the queue cannot drain.
    pool.add_task(0).unwrap();
    assert!(wait_until(WAIT, || pool.info().busy_threads == 1));

    for task in 1..=capacity as u32 {
        pool.add_task(task).unwrap();
    }
    assert_eq!(pool.info().current_queue, capacity);
    assert!(matches!(
        pool.add_task(99),
        Err(PoolError::QueueFull { capacity: 3, .. })
    ));

    // Releasing one task lets the worker dequeue the next one.
    gate.send(()).unwrap();
    assert!(wait_until(WAIT, || pool.info().current_queue == capacity - 1));
    pool.add_task(4).unwrap();

    for _ in 0..capacity + 1 {
        gate.send(()).unwrap();
    }
    assert!(wait_until(WAIT, || handled.lock().unwrap().len() == 5));
    pool.stop();
    pool.join();
    assert_eq!(*handled.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_single_worker_runs_tasks_in_fifo_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let pool = WorkerPool::new("fifo", 1, 100, move |task: u32| {
        seen.lock().unwrap().push(task);
        Ok(())
    });
    pool.start(|| {}).unwrap();
    for task in 0..50 {
        pool.add_task(task).unwrap();
    }
    assert!(wait_until(WAIT, || pool.info().completed_tasks == 50));
    pool.stop();
    pool.join();
    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_panicking_task_is_counted_and_worker_survives() {
    let pool = WorkerPool::new("panics", 1, 10, |task: u32| {
        if task == 1 {
            panic!("task {} exploded", task);
        }
        Ok(())
    });
    pool.start(|| {}).unwrap();
    for task in 0..4 {
        pool.add_task(task).unwrap();
    }
    assert!(wait_until(WAIT, || {
        let info = pool.info();
        info.completed_tasks == 3 && info.failed_tasks == 1
    }));
    pool.stop();
    pool.join();
}

#[test]
fn test_stop_discards_queued_tasks() {
    let (pool, gate, handled) = gated_pool(10);
    pool.start(|| {}).unwrap();
    pool.add_task(0).unwrap();
    assert!(wait_until(WAIT, || pool.info().busy_threads == 1));
    for task in 1..5 {
        pool.add_task(task).unwrap();
    }

    pool.stop();
    assert_eq!(pool.info().current_queue, 0);
    gate.send(()).unwrap();
    pool.join();

    // The running task finishes; the queued ones never run.
    assert_eq!(*handled.lock().unwrap(), vec![0]);
    assert_eq!(pool.info().completed_tasks, 1);
}

#[test]
fn test_init_runs_once_per_worker_and_start_is_idempotent() {
    let inits = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new("init", 3, 10, |_: u32| Ok(()));

    let counter = Arc::clone(&inits);
    pool.start(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let counter = Arc::clone(&inits);
    pool.start(move || {
        counter.fetch_add(100, Ordering::SeqCst);
    })
    .unwrap();

    assert!(wait_until(WAIT, || inits.load(Ordering::SeqCst) == 3));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(inits.load(Ordering::SeqCst), 3);
    pool.stop();
    pool.join();
}

#[test]
fn test_pool_restarts_after_join() {
    let handled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&handled);
    let pool = WorkerPool::new("restart", 2, 10, move |_: u32| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for round in 1..=2 {
        pool.start(|| {}).unwrap();
        pool.add_task(round).unwrap();
        assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == round as usize));
        pool.stop();
        pool.join();
    }
    assert_eq!(pool.info().completed_tasks, 2);
}

#[test]
fn test_drop_stops_and_joins() {
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let seen = Arc::clone(&handled);
        let pool = WorkerPool::new("dropped", 2, 10, move |_: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.start(|| {}).unwrap();
        pool.add_task(1).unwrap();
        assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));
    }
    // Only the handler clone captured by the test remains.
    assert_eq!(Arc::strong_count(&handled), 1);
}
