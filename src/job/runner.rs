//! Concrete job runner: resolves an item's worker class to a handler and
//! keeps a log of failed performs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::Value;

use super::{JobError, JobRunner};
use crate::model::Item;
use crate::runtime::RuntimeContext;
use crate::telemetry::metrics;

/// Job code for one worker class.
///
/// `ctx` is the context of the running attempt. Values inserted there are
/// merged into the attempt's terminal event.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, args: &[Value], ctx: &RuntimeContext) -> Result<(), JobError>;
}

/// Maps worker class names to handlers.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn Perform>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `worker_class`, replacing any previous one.
    pub fn register(&mut self, worker_class: impl Into<String>, handler: Arc<dyn Perform>) {
        self.handlers.insert(worker_class.into(), handler);
    }

    pub fn get(&self, worker_class: &str) -> Option<Arc<dyn Perform>> {
        self.handlers.get(worker_class).cloned()
    }

    pub fn worker_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("worker_classes", &self.worker_classes())
            .finish()
    }
}

/// A job whose perform failed.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub queue: String,
    pub item: Item,
    pub error: JobError,
    pub failed_at: DateTime<Utc>,
}

/// Shared, append-only record of failed jobs.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    entries: Arc<Mutex<Vec<FailedJob>>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FailedJob>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, failed: FailedJob) {
        self.lock().push(failed);
    }

    pub fn all(&self) -> Vec<FailedJob> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// One popped item bound to its handler.
pub struct Job {
    queue: String,
    item: Item,
    handler: Option<Arc<dyn Perform>>,
    failures: FailureLog,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        item: Item,
        registry: &JobRegistry,
        failures: FailureLog,
    ) -> Self {
        let handler = registry.get(&item.worker_class);
        Self {
            queue: queue.into(),
            item,
            handler,
            failures,
        }
    }
}

#[async_trait]
impl JobRunner for Job {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn payload(&self) -> &Item {
        &self.item
    }

    async fn perform(&mut self) -> Result<(), JobError> {
        let Some(handler) = self.handler.clone() else {
            return Err(JobError::new(
                "UnknownJob",
                format!("no handler registered for {}", self.item.worker_class),
            ));
        };
        // Inside an instrumented attempt this is the attempt's context;
        // otherwise values the handler sets go nowhere.
        let ctx = RuntimeContext::current().unwrap_or_else(RuntimeContext::detached);
        handler.perform(&self.item.args, &ctx).await
    }

    async fn fail(&mut self, error: &JobError) {
        tracing::warn!(
            queue = %self.queue,
            worker_class = %self.item.worker_class,
            error = %error,
            "job failed"
        );
        metrics::jobs_failed().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("worker_class", self.item.worker_class.clone()),
            ],
        );
        self.failures.record(FailedJob {
            queue: self.queue.clone(),
            item: self.item.clone(),
            error: error.clone(),
            failed_at: Utc::now(),
        });
    }
}
