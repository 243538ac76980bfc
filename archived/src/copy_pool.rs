use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info};

use crate::backend::{BackendError, CopyJob, StorageBackend};
use crate::config::Config;

struct BatchTask {
    handle: JoinHandle<Result<(), BackendError>>,
    jobs: Vec<CopyJob>,
    /// Completed or running attempts for this job list, starting at 1.
    attempts: u32,
}

/// Bounded pool of concurrently executing copy batches.
///
/// Jobs accumulate into a pending batch; a full batch is handed to a new
/// task while the in-flight count stays below `max_threads` (reaping
/// finished tasks first, with a short poll timeout rather than a single
/// blocking join). A failed batch is retried in place with an incremented
/// counter until the retry budget is spent, then folded into the
/// aggregate status. Archive operations stop spawning new batches once
/// the aggregate is false; backups are best-effort and keep going.
pub struct CopyPool {
    backend: Arc<dyn StorageBackend>,
    batch_size: usize,
    max_threads: usize,
    max_retries: u32,
    join_timeout: Duration,
    best_effort: bool,
    pending: Vec<CopyJob>,
    in_flight: Vec<BatchTask>,
    ok: bool,
}

impl CopyPool {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &Config, best_effort: bool) -> Self {
        Self {
            backend,
            batch_size: config.batch_size.max(1),
            max_threads: config.max_threads.max(1),
            max_retries: config.max_retries.max(1),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            best_effort,
            pending: Vec::new(),
            in_flight: Vec::new(),
            ok: true,
        }
    }

    /// Append a job; a full pending batch is flushed immediately.
    /// Returns the aggregate status so far.
    pub async fn submit(&mut self, job: CopyJob) -> bool {
        self.pending.push(job);
        if self.pending.len() >= self.batch_size {
            self.flush(false).await
        } else {
            self.ok
        }
    }

    /// Hand the pending batch to a new task, enforcing the in-flight
    /// bound. With `wait_all`, or once an archive batch has failed
    /// terminally, block until every outstanding task is collected.
    pub async fn flush(&mut self, wait_all: bool) -> bool {
        while self.in_flight.len() >= self.max_threads {
            self.reap(false).await;
        }

        if !self.pending.is_empty() && (self.best_effort || self.ok) {
            let jobs = std::mem::take(&mut self.pending);
            self.spawn_batch(jobs, 1);
        }

        if (!self.best_effort && !self.ok) || wait_all {
            while !self.in_flight.is_empty() {
                self.reap(true).await;
            }
        }
        self.ok
    }

    /// Logical AND of every job's final outcome so far.
    pub fn aggregate_ok(&self) -> bool {
        self.ok
    }

    async fn reap(&mut self, block: bool) {
        let tasks = std::mem::take(&mut self.in_flight);
        let mut still_running = Vec::new();
        let mut retry = Vec::new();

        for mut task in tasks {
            let joined = if block {
                Some((&mut task.handle).await)
            } else {
                match timeout(self.join_timeout, &mut task.handle).await {
                    Ok(res) => Some(res),
                    Err(_) => None,
                }
            };

            let Some(join_res) = joined else {
                still_running.push(task);
                continue;
            };

            let outcome = match join_res {
                Ok(res) => res,
                Err(e) => Err(BackendError::failed("copy", "<batch>", e)),
            };

            match outcome {
                Ok(()) => {
                    info!("Batch of {} jobs done, attempts={}", task.jobs.len(), task.attempts);
                }
                Err(e) if task.attempts < self.max_retries => {
                    info!(
                        "Batch failed (attempts={}), retrying: {}",
                        task.attempts, e
                    );
                    retry.push((task.jobs, task.attempts + 1));
                }
                Err(e) => {
                    error!(
                        "Batch failed terminally after {} attempts: {}",
                        task.attempts, e
                    );
                    self.ok = false;
                }
            }
        }

        self.in_flight = still_running;
        for (jobs, attempts) in retry {
            self.spawn_batch(jobs, attempts);
        }
    }

    fn spawn_batch(&mut self, jobs: Vec<CopyJob>, attempts: u32) {
        let backend = self.backend.clone();
        let job_list = jobs.clone();
        let handle = tokio::spawn(async move { backend.copy_batch(&job_list).await });
        self.in_flight.push(BatchTask {
            handle,
            jobs,
            attempts,
        });
    }
}
