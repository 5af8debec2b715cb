//! Background executor for CPU-bound audio work (Opus encode/decode).
//!
//! A single named worker thread drains a bounded FIFO queue. The main loop
//! uses [`BackgroundTask::wait_for_completion`] as its only barrier before a
//! state change takes effect.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::util::{lock, wait};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default queue depth before producers start blocking.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

struct Queue {
    jobs: VecDeque<Job>,
    submitted: u64,
    completed: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    job_ready: Condvar,
    space_ready: Condvar,
    job_done: Condvar,
    capacity: usize,
}

pub struct BackgroundTask {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn new(capacity: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                submitted: 0,
                completed: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            space_ready: Condvar::new(),
            job_done: Condvar::new(),
            capacity: capacity.max(1),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("background-task".into())
                .spawn(move || worker_loop(&shared))
                .context("Failed to spawn background task thread")?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue a job. Blocks while the queue is full.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = lock(&self.shared.queue);
        while queue.jobs.len() >= self.shared.capacity {
            queue = wait(&self.shared.space_ready, queue);
        }
        queue.jobs.push_back(Box::new(job));
        queue.submitted += 1;
        self.shared.job_ready.notify_one();
    }

    /// Block until every job submitted before this call has finished.
    ///
    /// Must not be called from inside a job.
    pub fn wait_for_completion(&self) {
        let mut queue = lock(&self.shared.queue);
        let target = queue.submitted;
        while queue.completed < target {
            queue = wait(&self.shared.job_done, queue);
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        lock(&self.shared.queue).shutdown = true;
        self.shared.job_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = wait(&shared.job_ready, queue);
            }
        };
        shared.space_ready.notify_one();

        // 任务 panic 也要计入完成数，否则 wait_for_completion 会永远阻塞
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Background task panicked");
        }

        let mut queue = lock(&shared.queue);
        queue.completed += 1;
        shared.job_done.notify_all();
    }
}
