//! Worker loop: pop, perform, fail.
//!
//! Items are popped through a [`QueueInterceptor`] and run through a
//! [`JobInterceptor`], so one worker produces the full `dequeued` →
//! `perform_started` → `perform_finished | failed` sequence for every
//! instrumented item.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{error, info};

use super::runner::{FailureLog, Job, JobRegistry};
use super::{JobError, JobInterceptor, JobRunner};
use crate::error::Result;
use crate::instrument::Instrumentation;
use crate::queue::{QueueInterceptor, QueueTransport};
use crate::telemetry::metrics;

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// How one popped item ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Finished { worker_class: String },
    Failed { worker_class: String, error: JobError },
}

/// Pops items from a queue and performs them until shut down.
pub struct Worker<T> {
    queue: QueueInterceptor<Arc<T>>,
    registry: Arc<JobRegistry>,
    instrumentation: Arc<Instrumentation>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    failures: FailureLog,
}

impl<T: QueueTransport> Worker<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<JobRegistry>,
        instrumentation: Arc<Instrumentation>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue: QueueInterceptor::new(transport, Arc::clone(&instrumentation)),
            registry,
            instrumentation,
            config,
            shutdown: Arc::new(Notify::new()),
            failures: FailureLog::new(),
        }
    }

    /// Jobs that failed on this worker.
    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    /// Signal the loop to stop after the current item.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Pop and perform at most one item. `None` when the queue was empty.
    ///
    /// Transport errors are returned; job failures are reported in the
    /// outcome.
    pub async fn work_once(&self, queue: &str) -> Result<Option<JobOutcome>> {
        let Some(item) = self.queue.pop(queue).await? else {
            return Ok(None);
        };
        let worker_class = item.worker_class.clone();
        let job = Job::new(queue, item, &self.registry, self.failures.clone());
        let mut job = JobInterceptor::new(job, Arc::clone(&self.instrumentation));

        let started = Instant::now();
        let outcome = match job.perform().await {
            Ok(()) => JobOutcome::Finished { worker_class },
            Err(error) => {
                job.fail(&error).await;
                JobOutcome::Failed {
                    worker_class,
                    error,
                }
            }
        };
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "job.perform")],
        );
        Ok(Some(outcome))
    }

    /// Run the worker loop on `queue` until [`Worker::shutdown`].
    pub async fn run(&self, queue: &str) -> Result<()> {
        info!(queue, "worker started");
        loop {
            let worked = match self.work_once(queue).await {
                Ok(outcome) => outcome.is_some(),
                Err(e) => {
                    error!(queue, "work_once error: {e}");
                    false
                }
            };
            // Drain without sleeping while there is work.
            let pause = if worked {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(queue, "worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
