//! GC Thread Pool - Pausable, Resizable Worker Pool
//!
//! Collector phases hand batches of region work to this pool. The pool is
//! created stopped, with a fixed number of threads, and moves through:
//!
//! ```text
//!            start()                 exit()
//! Stopped ───────────► Running ───────────────► Exited
//!    ▲                    │
//!    └────────────────────┘
//!      stop() / wait_finish()
//! ```
//!
//! Each worker is Sleeping (pool stopped, or above the active limit),
//! WaitingForTask (running, queue empty) or Executing.
//!
//! ## Completion
//!
//! `wait_finish` lets the caller execute queued tasks itself, then waits
//! until every active worker is idle with the queue empty, stops the pool
//! and drains anything enqueued during that transition.

use crate::error::{HeapError, Result};
use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of pool work; receives the id of the thread running it
pub type Task = Box<dyn FnOnce(usize) + Send + 'static>;

#[derive(Debug)]
struct PoolState {
    running: bool,
    exit: bool,
    curr_active: usize,
    waiting: usize,
    max_active: usize,
    executing: usize,
}

struct Shared {
    queue: Injector<Task>,
    state: Mutex<PoolState>,
    sleep_cv: Condvar,
    task_cv: Condvar,
    finish_cv: Condvar,
    stop_cv: Condvar,
    executed: AtomicUsize,
    panic_payload: Mutex<Option<Box<dyn Any + Send>>>,
    max_threads: usize,
}

impl Shared {
    fn pop(&self) -> Option<Task> {
        loop {
            match self.queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn run(&self, task: Task, id: usize) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(id))) {
            log::error!("[GC Worker {}] task panicked", id);
            let mut slot = self.panic_payload.lock();
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn leave_active(&self, state: &mut MutexGuard<'_, PoolState>) {
        state.curr_active -= 1;
        self.stop_cv.notify_all();
        self.finish_cv.notify_all();
    }

    fn worker_loop(&self, id: usize) {
        let mut state = self.state.lock();
        loop {
            while !state.exit && !(state.running && state.curr_active < state.max_active) {
                self.sleep_cv.wait(&mut state);
            }
            if state.exit {
                return;
            }
            state.curr_active += 1;

            loop {
                if state.exit {
                    self.leave_active(&mut state);
                    return;
                }
                if !state.running || state.curr_active > state.max_active {
                    self.leave_active(&mut state);
                    break;
                }

                if let Some(task) = self.pop() {
                    state.executing += 1;
                    MutexGuard::unlocked(&mut state, || self.run(task, id));
                    state.executing -= 1;
                    continue;
                }

                state.waiting += 1;
                self.finish_cv.notify_all();
                self.task_cv.wait(&mut state);
                state.waiting -= 1;
            }
        }
    }
}

/// Snapshot of pool state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub threads: usize,
    pub max_active: usize,
    pub active: usize,
    pub waiting: usize,
    pub executed_tasks: usize,
    pub queued: bool,
    pub running: bool,
    pub exited: bool,
}

/// Fixed-size worker pool driving parallel collector work
pub struct GcThreadPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GcThreadPool {
    /// Spawn `max_threads` workers (at least one), all sleeping
    ///
    /// # Errors
    /// `WorkerSpawn` if the OS refuses a thread. Threads already spawned
    /// are shut down first.
    pub fn new(max_threads: usize, name: &str) -> Result<Self> {
        let max_threads = max_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Injector::new(),
            state: Mutex::new(PoolState {
                running: false,
                exit: false,
                curr_active: 0,
                waiting: 0,
                max_active: max_threads,
                executing: 0,
            }),
            sleep_cv: Condvar::new(),
            task_cv: Condvar::new(),
            finish_cv: Condvar::new(),
            stop_cv: Condvar::new(),
            executed: AtomicUsize::new(0),
            panic_payload: Mutex::new(None),
            max_threads,
        });

        let pool = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(max_threads)),
        };

        for id in 0..max_threads {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || shared.worker_loop(id));

            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    pool.exit();
                    return Err(HeapError::WorkerSpawn(format!("{}-{}: {}", name, id, e)));
                },
            }
        }

        log::debug!("[{}] thread pool created with {} workers", name, max_threads);
        Ok(pool)
    }

    /// Number of worker threads
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    pub fn max_active_thread_num(&self) -> usize {
        self.shared.state.lock().max_active
    }

    /// Let workers pick up tasks
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.exit {
            return;
        }
        state.running = true;
        self.shared.sleep_cv.notify_all();
    }

    /// Queue a task
    ///
    /// Wakes one idle worker when the pool is running.
    pub fn add_work<F>(&self, task: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.shared.queue.push(Box::new(task));
        let state = self.shared.state.lock();
        if state.running && state.waiting > 0 {
            self.shared.task_cv.notify_one();
        }
    }

    /// Limit how many workers execute at once, clamped to `[1, max_threads]`
    pub fn set_max_active_thread_num(&self, n: usize) {
        let n = n.clamp(1, self.shared.max_threads);
        let mut state = self.shared.state.lock();
        let raised = n > state.max_active;
        state.max_active = n;

        if raised {
            if state.running {
                self.shared.sleep_cv.notify_all();
            }
        } else {
            // Idle workers above the new limit have to notice and sleep.
            self.shared.task_cv.notify_all();
        }
        self.shared.finish_cv.notify_all();
    }

    /// Run queued tasks to completion and stop the pool
    ///
    /// The calling thread executes tasks too, with worker id
    /// `max_threads()`. A panic raised by any task since the last call is
    /// resumed here once the pool is quiescent.
    pub fn wait_finish(&self) {
        let caller_id = self.shared.max_threads;

        loop {
            {
                let state = self.shared.state.lock();
                if state.exit {
                    break;
                }
            }
            match self.shared.pop() {
                Some(task) => self.shared.run(task, caller_id),
                None => break,
            }
        }

        {
            let mut state = self.shared.state.lock();
            while !state.exit
                && state.running
                && !(state.waiting >= state.max_active
                    && state.executing == 0
                    && self.shared.queue.is_empty())
            {
                self.shared.finish_cv.wait(&mut state);
            }
            state.running = false;
            self.shared.task_cv.notify_all();
        }

        while let Some(task) = self.shared.pop() {
            self.shared.run(task, caller_id);
        }

        if let Some(payload) = self.shared.panic_payload.lock().take() {
            panic::resume_unwind(payload);
        }
    }

    /// Stop the pool and wait until no worker is active
    ///
    /// Calling it on a stopped pool returns immediately.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.running = false;
        self.shared.task_cv.notify_all();
        while state.curr_active > 0 && !state.exit {
            self.shared.stop_cv.wait(&mut state);
        }
    }

    /// Shut the pool down for good and join every worker
    ///
    /// Queued tasks that no worker picked up are dropped.
    pub fn exit(&self) {
        {
            let mut state = self.shared.state.lock();
            state.exit = true;
            state.running = false;
            self.shared.sleep_cv.notify_all();
            self.shared.task_cv.notify_all();
            self.shared.finish_cv.notify_all();
            self.shared.stop_cv.notify_all();
        }

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("GC worker thread terminated abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_exited(&self) -> bool {
        self.shared.state.lock().exit
    }

    /// Total tasks executed by workers and callers
    pub fn executed_tasks(&self) -> usize {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            threads: self.shared.max_threads,
            max_active: state.max_active,
            active: state.curr_active,
            waiting: state.waiting,
            executed_tasks: self.executed_tasks(),
            queued: !self.shared.queue.is_empty(),
            running: state.running,
            exited: state.exit,
        }
    }
}

impl Drop for GcThreadPool {
    fn drop(&mut self) {
        self.exit();
    }
}

impl std::fmt::Debug for GcThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcThreadPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_exactly_once() {
        let pool = GcThreadPool::new(4, "test-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.start();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add_work(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_finish();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.executed_tasks(), 100);
        assert!(!pool.is_running());
        assert!(!pool.stats().queued);
    }

    #[test]
    fn test_wait_finish_on_stopped_pool_runs_on_caller() {
        let pool = GcThreadPool::new(2, "test-pool").unwrap();
        let ids = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let ids = Arc::clone(&ids);
            pool.add_work(move |id| ids.lock().push(id));
        }
        pool.wait_finish();

        assert_eq!(*ids.lock(), vec![2, 2, 2]);
    }

    #[test]
    fn test_pool_restarts_after_wait_finish() {
        let pool = GcThreadPool::new(2, "test-pool").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for round in 1..=3 {
            pool.start();
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.add_work(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.wait_finish();
            assert_eq!(counter.load(Ordering::SeqCst), round * 10);
        }
    }

    #[test]
    fn test_max_active_is_clamped() {
        let pool = GcThreadPool::new(3, "test-pool").unwrap();
        pool.set_max_active_thread_num(0);
        assert_eq!(pool.max_active_thread_num(), 1);
        pool.set_max_active_thread_num(99);
        assert_eq!(pool.max_active_thread_num(), 3);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = GcThreadPool::new(2, "test-pool").unwrap();
        pool.start();
        std::thread::sleep(Duration::from_millis(10));
        pool.stop();
        pool.stop();
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_exit_is_terminal() {
        let pool = GcThreadPool::new(2, "test-pool").unwrap();
        pool.start();
        pool.exit();
        assert!(pool.is_exited());

        pool.start();
        assert!(!pool.is_running());
        pool.exit();
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn test_task_panic_resumes_in_wait_finish() {
        let pool = GcThreadPool::new(2, "test-pool").unwrap();
        pool.start();
        pool.add_work(|_| panic!("boom"));
        pool.wait_finish();
    }
}
