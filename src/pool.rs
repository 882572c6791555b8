//! Bounded worker pool with an unbounded FIFO queue and graceful shutdown.
//!
//! Tasks are opaque closures. A panicking task is caught and logged so a
//! misbehaving request handler never takes a worker thread down with it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{ServerError, ServerResult};

/// Hard cap on pool size regardless of what the caller asks for.
pub const MAX_WORKERS: usize = 128;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawn a pool of `threads` workers. Zero auto-detects hardware
    /// parallelism; the result is clamped to `1..=MAX_WORKERS`.
    pub fn new(threads: usize) -> Self {
        let count = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        }
        .clamp(1, MAX_WORKERS);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("plinth-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        tracing::info!(workers = count, "worker pool started");

        Self {
            shared,
            workers: Mutex::new(workers),
            thread_count: count,
        }
    }

    /// Enqueue a task. Fails once shutdown has started.
    pub fn submit<F>(&self, task: F) -> ServerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ServerError::PoolShutdown);
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            // Recheck under the lock so a task can't slip in behind the
            // shutdown flag and get stranded.
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(ServerError::PoolShutdown);
            }
            queue.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Refuse new submissions, let queued work drain, join every worker.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.available.notify_all();

        let handles = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("worker pool stopped");
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(panic = %msg, "worker task panicked");
        }
    }
}
