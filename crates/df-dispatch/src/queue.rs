//! Worker dispatch queue with a bounded-concurrency drain loop.
//!
//! Jobs accepted off the bus (or produced internally) queue here and a
//! background loop drains them in batches of at most `thread_count`,
//! awaiting each batch fully before starting the next. The queue size is
//! snapshotted at the start of every cycle, so jobs enqueued while a drain
//! is running wait for the next cycle and a sustained enqueue burst can
//! never keep one cycle iterating forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use df_common::{DispatchJob, RetryInvoker, RetryPolicy};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::DispatchError;

#[derive(Debug, Clone)]
pub struct DispatchQueueConfig {
    /// Concurrency ceiling: at most this many jobs run at once.
    pub thread_count: usize,
    /// Sleep between cycles when the queue is empty.
    pub waiting_period: Duration,
    /// Per-job retry policy for retryable failures.
    pub job_retry: RetryPolicy,
    /// Enqueue rejects beyond this depth.
    pub max_queue_depth: usize,
}

impl Default for DispatchQueueConfig {
    fn default() -> Self {
        Self {
            thread_count: 4,
            waiting_period: Duration::from_secs(5),
            job_retry: RetryPolicy::backoff(3, Duration::from_millis(500)),
            max_queue_depth: 10_000,
        }
    }
}

/// Whether a failed execution attempt is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("retryable job failure: {0}")]
    Retryable(String),

    #[error("permanent job failure: {0}")]
    Permanent(String),
}

/// The business-logic seam: what actually happens to a dequeued job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &DispatchJob) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub thread_count: usize,
}

pub struct WorkerDispatchQueue {
    config: DispatchQueueConfig,
    executor: Arc<dyn JobExecutor>,
    queue: Mutex<VecDeque<DispatchJob>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerDispatchQueue {
    pub fn new(config: DispatchQueueConfig, executor: Arc<dyn JobExecutor>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            executor,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            shutdown_tx,
        }
    }

    pub fn enqueue(&self, job: DispatchJob) -> Result<(), DispatchError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutdownInProgress);
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queue_depth {
            return Err(DispatchError::QueueFull {
                depth: queue.len(),
            });
        }
        queue.push_back(job);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.queue.lock().len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            thread_count: self.config.thread_count,
        }
    }

    /// Drain loop. Runs until [`WorkerDispatchQueue::shutdown`].
    pub async fn run(&self) {
        info!(
            thread_count = self.config.thread_count,
            waiting_period_secs = self.config.waiting_period.as_secs(),
            "Worker dispatch queue started"
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while self.running.load(Ordering::SeqCst) {
            let drained = self.drain_cycle().await;
            if drained == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.waiting_period) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        info!(
            remaining = self.queue.lock().len(),
            "Worker dispatch queue stopped"
        );
    }

    /// Stop accepting batches. The in-flight batch completes; remaining
    /// jobs stay queued.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// One drain cycle: snapshot the depth, dequeue at most that many
    /// jobs, and run them in batches no larger than `thread_count`.
    async fn drain_cycle(&self) -> usize {
        let snapshot = self.queue.lock().len();
        if snapshot == 0 {
            return 0;
        }

        let mut jobs: Vec<DispatchJob> = {
            let mut queue = self.queue.lock();
            let take = snapshot.min(queue.len());
            queue.drain(..take).collect()
        };

        debug!(jobs = jobs.len(), "Draining dispatch queue");
        let mut processed = 0;

        while !jobs.is_empty() {
            if !self.running.load(Ordering::SeqCst) {
                // Shutdown mid-drain: put the untouched remainder back so
                // nothing is silently lost.
                let mut queue = self.queue.lock();
                for job in jobs.drain(..).rev() {
                    queue.push_front(job);
                }
                break;
            }

            let batch_size = jobs.len().min(self.config.thread_count);
            let batch: Vec<DispatchJob> = jobs.drain(..batch_size).collect();
            processed += batch.len();

            // Await the whole batch before starting the next one; one
            // job's failure never aborts its siblings.
            futures::future::join_all(batch.into_iter().map(|job| self.run_job(job))).await;
        }

        processed
    }

    async fn run_job(&self, job: DispatchJob) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let executor = self.executor.clone();
        let attempts = Arc::new(AtomicU32::new(0));
        let job_id = job.id;

        // Permanent failures short-circuit the retry policy by mapping to
        // the invoker's success path with an inner error.
        let outcome: Option<Result<(), String>> = RetryInvoker::run_with(
            self.config.job_retry,
            || {
                let executor = executor.clone();
                let attempts = attempts.clone();
                let mut job = job.clone();
                async move {
                    job.attempt_count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    match executor.execute(&job).await {
                        Ok(()) => Ok(Ok(())),
                        Err(JobError::Permanent(reason)) => Ok(Err(reason)),
                        Err(JobError::Retryable(reason)) => Err(reason),
                    }
                }
            },
            |attempt, reason| {
                warn!(job_id = %job_id, attempt = attempt, reason = %reason, "Job attempt failed, will retry");
            },
            |reason| {
                error!(job_id = %job_id, reason = %reason, "Job failed after exhausting retry attempts");
            },
        )
        .await;

        match outcome {
            Some(Ok(())) => {
                debug!(job_id = %job_id, attempts = attempts.load(Ordering::SeqCst), "Job completed");
            }
            Some(Err(reason)) => {
                error!(job_id = %job_id, reason = %reason, "Job failed permanently, not retrying");
            }
            None => {
                // Exhaustion was already logged by the on_failure callback.
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ProbeExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
        executed: AtomicUsize,
        fail_first_attempts: AtomicUsize,
    }

    impl ProbeExecutor {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                executed: AtomicUsize::new(0),
                fail_first_attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobExecutor for ProbeExecutor {
        async fn execute(&self, _job: &DispatchJob) -> Result<(), JobError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_first_attempts.load(Ordering::SeqCst) > 0 {
                self.fail_first_attempts.fetch_sub(1, Ordering::SeqCst);
                return Err(JobError::Retryable("induced".to_string()));
            }
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue_with(
        executor: Arc<ProbeExecutor>,
        thread_count: usize,
    ) -> Arc<WorkerDispatchQueue> {
        Arc::new(WorkerDispatchQueue::new(
            DispatchQueueConfig {
                thread_count,
                waiting_period: Duration::from_millis(10),
                job_retry: RetryPolicy::fixed(3, Duration::ZERO),
                max_queue_depth: 100,
            },
            executor,
        ))
    }

    #[tokio::test]
    async fn burst_never_exceeds_thread_count_concurrency() {
        let executor = Arc::new(ProbeExecutor::new());
        let queue = queue_with(executor.clone(), 10);

        for i in 0..37 {
            queue
                .enqueue(DispatchJob::new(json!({ "n": i })))
                .unwrap();
        }

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run().await })
        };

        // Wait for the drain to finish.
        for _ in 0..200 {
            if executor.executed.load(Ordering::SeqCst) == 37 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        queue.shutdown();
        runner.await.unwrap();

        assert_eq!(executor.executed.load(Ordering::SeqCst), 37);
        assert!(executor.peak.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn retryable_failure_does_not_abort_siblings() {
        let executor = Arc::new(ProbeExecutor::new());
        executor.fail_first_attempts.store(2, Ordering::SeqCst);
        let queue = queue_with(executor.clone(), 4);

        for i in 0..6 {
            queue
                .enqueue(DispatchJob::new(json!({ "n": i })))
                .unwrap();
        }

        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run().await })
        };

        for _ in 0..200 {
            if executor.executed.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        queue.shutdown();
        runner.await.unwrap();

        // All six jobs eventually succeed: the induced failures retried.
        assert_eq!(executor.executed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn enqueue_rejects_beyond_capacity() {
        let executor = Arc::new(ProbeExecutor::new());
        let queue = WorkerDispatchQueue::new(
            DispatchQueueConfig {
                max_queue_depth: 2,
                ..Default::default()
            },
            executor,
        );

        queue.enqueue(DispatchJob::new(json!({}))).unwrap();
        queue.enqueue(DispatchJob::new(json!({}))).unwrap();
        let err = queue.enqueue(DispatchJob::new(json!({}))).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { depth: 2 }));
    }

    #[tokio::test]
    async fn shutdown_keeps_undrained_jobs_queued() {
        let executor = Arc::new(ProbeExecutor::new());
        let queue = queue_with(executor, 2);

        for i in 0..4 {
            queue
                .enqueue(DispatchJob::new(json!({ "n": i })))
                .unwrap();
        }
        queue.shutdown();

        // The loop exits without accepting a new batch; jobs stay queued
        // and enqueue now refuses new work.
        queue.run().await;
        assert_eq!(queue.stats().depth, 4);
        assert!(matches!(
            queue.enqueue(DispatchJob::new(json!({}))),
            Err(DispatchError::ShutdownInProgress)
        ));
    }
}
