//! A fixed-size worker pool with normal and emergency lanes.

use crate::future::{promise, SharedFuture};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Queue lane for a submitted job. Emergency jobs jump the queue head;
/// running jobs are never preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Emergency,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<Lanes>,
    available: Condvar,
}

struct Lanes {
    jobs: VecDeque<Job>,
    stop: bool,
}

/// Thread pool backing the autoscheduler and the function builder.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Lanes {
                jobs: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        });
        let workers = (0..workers.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || Self::worker_loop(shared))
                    .expect("spawn pool worker")
            })
            .collect();
        Self { shared, workers }
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let job = {
                let mut lanes = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(job) = lanes.jobs.pop_front() {
                        break job;
                    }
                    if lanes.stop {
                        return;
                    }
                    lanes = shared
                        .available
                        .wait(lanes)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };
            job();
        }
    }

    /// Submit a job; the returned future resolves to its result. An
    /// emergency submission lands at the queue head.
    pub fn submit<T, F>(&self, priority: Priority, job: F) -> SharedFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (resolver, future) = promise();
        let wrapped: Job = Box::new(move || resolver.fulfill(job()));
        {
            let mut lanes = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            if lanes.stop {
                drop(lanes);
                // Resolve immediately instead of leaving a waiter hanging.
                let (p, f) = promise::<T>();
                p.fulfill(Err(anyhow::anyhow!("worker pool is shut down")));
                return f;
            }
            match priority {
                Priority::Normal => lanes.jobs.push_back(wrapped),
                Priority::Emergency => lanes.jobs.push_front(wrapped),
            }
        }
        self.shared.available.notify_one();
        future
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .len()
    }

    fn shutdown(&mut self) {
        {
            let mut lanes = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            lanes.stop = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
