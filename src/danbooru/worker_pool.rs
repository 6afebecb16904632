//! Fixed-size worker pool with a completion barrier
//!
//! Both the page collection stage and the download stage push their tasks
//! through this pool:
//! 1. Every task is enqueued up front on an MPMC channel, then the sender is dropped
//! 2. A fixed number of workers dequeue until the channel is closed and empty
//! 3. Each task runs in its own spawned task so a panic is recorded as a failure
//! 4. `run` returns only after every worker has exited

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Result of a single task as reported by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// Accounting returned once the pool has drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub enqueued: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks still queued when the cancellation token fired.
    pub cancelled: usize,
}

#[derive(Default)]
struct PoolCounters {
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl PoolCounters {
    fn record(&self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            TaskOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.processed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Number of workers used when none is configured.
pub fn default_workers() -> usize {
    num_cpus::get().max(1)
}

/// Resolves a configured worker count, where 0 means "one per CPU".
pub fn resolve_workers(configured: usize) -> usize {
    if configured == 0 {
        default_workers()
    } else {
        configured
    }
}

/// A reusable pool of `workers` concurrent task processors.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool. A worker count of 0 falls back to the CPU count.
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers: resolve_workers(workers),
            cancel: CancellationToken::new(),
        }
    }

    /// Observes `token` at every dequeue; queued tasks are dropped once it fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `handler` over every task and blocks until all of them are processed.
    pub async fn run<T, F, Fut>(&self, tasks: impl IntoIterator<Item = T>, handler: F) -> PoolReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let (tx, rx) = flume::unbounded();
        let mut enqueued = 0;
        for task in tasks {
            // The receiver is held below, so sending cannot fail.
            if tx.send(task).is_ok() {
                enqueued += 1;
            }
        }
        drop(tx);

        debug!(pool = self.name, workers = self.workers, tasks = enqueued, "Starting worker pool");

        let handler = Arc::new(handler);
        let counters = Arc::new(PoolCounters::default());
        let mut join_set = JoinSet::new();

        for worker_id in 0..self.workers.min(enqueued) {
            let rx = rx.clone();
            let handler = handler.clone();
            let counters = counters.clone();
            let cancel = self.cancel.clone();
            let name = self.name;

            join_set.spawn(async move {
                loop {
                    let task = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(pool = name, worker_id, "Worker observed cancellation");
                            break;
                        }
                        task = rx.recv_async() => match task {
                            Ok(task) => task,
                            Err(_) => break,
                        },
                    };

                    let outcome = match tokio::spawn(handler(task)).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(pool = name, worker_id, "Task aborted: {}", e);
                            TaskOutcome::Failed
                        }
                    };
                    counters.record(outcome);
                }
                trace!(pool = name, worker_id, "Worker exiting");
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!(pool = self.name, "Worker terminated abnormally: {}", e);
            }
        }

        let cancelled = rx.drain().count();
        if cancelled > 0 {
            warn!(pool = self.name, cancelled, "Pool cancelled with tasks still queued");
        }

        let report = PoolReport {
            enqueued,
            processed: counters.processed.load(Ordering::Acquire),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled,
        };
        debug!(pool = self.name, ?report, "Worker pool drained");
        report
    }
}
