//! Job Pool
//!
//! Fixed pool of worker threads executing posted jobs in FIFO order.
//! Sessions post their result/dispatch job here; the pool itself knows
//! nothing about sessions.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Unit of work posted to the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared state between the pool handle and its workers
struct SharedPoolState {
    /// Pending jobs in posting order
    queue: Mutex<VecDeque<Job>>,

    /// Condition variable for notifying workers
    condvar: Condvar,

    /// Stop flag for shutdown
    stop_flag: AtomicBool,
}

/// Multi-threaded job pool
pub struct JobPool {
    state: Arc<SharedPoolState>,

    /// Worker thread handles, taken on shutdown
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    /// Create a pool with `num_threads` workers (at least one)
    pub fn new(num_threads: usize) -> Self {
        let state = Arc::new(SharedPoolState {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
        });

        let num_threads = num_threads.max(1);
        let mut threads = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let state_clone = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("camrt-job-{}", worker_id))
                .spawn(move || Self::worker_loop(worker_id, state_clone));

            match handle {
                Ok(handle) => threads.push(handle),
                Err(e) => error!("Failed to spawn job worker {}: {}", worker_id, e),
            }
        }

        info!("Job pool started with {} worker threads", threads.len());

        Self {
            state,
            threads: Mutex::new(threads),
        }
    }

    /// Post a job for execution
    pub fn post(&self, job: Job) -> Result<()> {
        if self.state.stop_flag.load(Ordering::Acquire) {
            return Err(Error::InvalidState("Job pool is shutting down".to_string()));
        }

        self.state.queue.lock().push_back(job);
        self.state.condvar.notify_one();
        Ok(())
    }

    /// Worker thread main loop
    fn worker_loop(worker_id: usize, state: Arc<SharedPoolState>) {
        debug!("Job worker {} started", worker_id);

        loop {
            let job = {
                let mut queue = state.queue.lock();

                // Wait for work or shutdown signal
                while queue.is_empty() && !state.stop_flag.load(Ordering::Acquire) {
                    state.condvar.wait(&mut queue);
                }

                if state.stop_flag.load(Ordering::Acquire) {
                    debug!("Job worker {} received shutdown signal", worker_id);
                    break;
                }

                match queue.pop_front() {
                    Some(job) => job,
                    None => continue,
                }
            };

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("Job worker {}: job panicked", worker_id);
            }
        }

        debug!("Job worker {} exiting", worker_id);
    }

    /// Stop all workers and join them
    ///
    /// Jobs still queued are dropped. Safe to call from a pool thread: the
    /// calling thread is not joined.
    pub fn shutdown(&self) {
        if self.state.stop_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down job pool");

        self.state.condvar.notify_all();

        let current = thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for (idx, handle) in threads.into_iter().enumerate() {
            if handle.thread().id() == current {
                continue;
            }
            match handle.join() {
                Ok(_) => debug!("Job worker {} joined successfully", idx),
                Err(e) => error!("Job worker {} join failed: {:?}", idx, e),
            }
        }

        let dropped = {
            let mut queue = self.state.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            debug!("Dropped {} queued jobs at shutdown", dropped);
        }

        info!("Job pool shut down");
    }

    /// Get queue length (for diagnostics)
    pub fn queue_len(&self) -> usize {
        self.state.queue.lock().len()
    }

    /// True once shutdown has started
    pub fn is_stopped(&self) -> bool {
        self.state.stop_flag.load(Ordering::Acquire)
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        // Signal only; joining from drop could deadlock when the last
        // reference is released on a pool thread
        self.state.stop_flag.store(true, Ordering::Release);
        self.state.condvar.notify_all();
    }
}
