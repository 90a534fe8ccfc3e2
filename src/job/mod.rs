//! Job runner capability and the job interceptor.
//!
//! [`JobInterceptor`] wraps a [`JobRunner`] and is itself one. With the gate
//! open and an instrumented payload, `perform` publishes `perform_started`,
//! runs the job inside a fresh [`RuntimeContext`], and publishes
//! `perform_finished` on success. `fail` lets the inner runner do its own
//! failure bookkeeping first, then publishes `failed` with the error
//! attached. Job errors are never swallowed or rewritten.

pub mod runner;
pub mod worker;

pub use runner::{FailedJob, FailureLog, Job, JobRegistry, Perform};
pub use worker::{JobOutcome, Worker, WorkerConfig};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::Instrument;

use crate::event::{EventType, LifecycleEvent};
use crate::instrument::Instrumentation;
use crate::metadata::{self, Stage, keys};
use crate::model::{Item, Metadata};
use crate::runtime::RuntimeContext;
use crate::telemetry::job as spans;

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// An error raised by job code.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    /// Error type name (e.g. "RuntimeError", "Timeout").
    pub kind: String,
    pub message: String,
    /// Stack frames captured where the error was built, outermost last.
    pub backtrace: Vec<String>,
}

impl JobError {
    /// Build an error of `kind`, capturing a backtrace at the call site.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            backtrace: capture_backtrace(),
        }
    }

    /// Wrap any error, naming it after its type.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let kind = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error");
        Self::new(kind, error.to_string())
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }
}

fn capture_backtrace() -> Vec<String> {
    std::backtrace::Backtrace::force_capture()
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// The primitives required of a job runner.
#[async_trait]
pub trait JobRunner: Send {
    /// Queue the job was popped from.
    fn queue(&self) -> &str;

    /// The payload as enqueued, including its metadata.
    fn payload(&self) -> &Item;

    /// Run the job. An `Err` is the job's own failure.
    async fn perform(&mut self) -> Result<(), JobError>;

    /// Record a failed perform.
    async fn fail(&mut self, error: &JobError);
}

/// State of the current perform attempt.
struct Attempt {
    started_at: f64,
    metadata: Metadata,
    context: RuntimeContext,
}

/// Instrumenting wrapper around a job runner.
pub struct JobInterceptor<J> {
    inner: J,
    instrumentation: Arc<Instrumentation>,
    attempt: Option<Attempt>,
}

impl<J: JobRunner> JobInterceptor<J> {
    pub fn new(inner: J, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
            attempt: None,
        }
    }

    pub fn inner(&self) -> &J {
        &self.inner
    }

    pub fn into_inner(self) -> J {
        self.inner
    }

    /// The runtime context of the latest perform attempt, if instrumented.
    pub fn context(&self) -> Option<&RuntimeContext> {
        self.attempt.as_ref().map(|a| &a.context)
    }

    fn event(&self, event_type: EventType, metadata: &Metadata) -> LifecycleEvent {
        let payload = self.inner.payload();
        LifecycleEvent {
            event_type,
            timestamp: Utc::now(),
            queue: self.inner.queue().to_string(),
            metadata: metadata.clone(),
            worker_class: payload.worker_class.clone(),
            args: payload.args.clone(),
        }
    }
}

#[async_trait]
impl<J: JobRunner> JobRunner for JobInterceptor<J> {
    fn queue(&self) -> &str {
        self.inner.queue()
    }

    fn payload(&self) -> &Item {
        self.inner.payload()
    }

    async fn perform(&mut self) -> Result<(), JobError> {
        if !self.instrumentation.is_enabled() {
            return self.inner.perform().await;
        }
        let Some(mut metadata) = self.inner.payload().metadata.clone() else {
            return self.inner.perform().await;
        };

        metadata::stamp_origin(&mut metadata, Stage::Performed);
        self.instrumentation
            .publish(&self.event(EventType::PerformStarted, &metadata));

        // A new context for every attempt; nothing carries over.
        let context = RuntimeContext::new(&metadata);
        self.attempt = Some(Attempt {
            started_at: metadata::now_epoch_seconds(),
            metadata,
            context: context.clone(),
        });

        let span = spans::start_perform_span(
            self.inner.queue(),
            &self.inner.payload().worker_class,
            self.inner
                .payload()
                .metadata
                .as_ref()
                .and_then(|m| m.get(keys::EVENT_HASH))
                .and_then(Value::as_str),
        );
        let outcome = RuntimeContext::scope(context, self.inner.perform())
            .instrument(span.clone())
            .await;

        if outcome.is_err() {
            spans::record_outcome(&span, "failed");
            return outcome;
        }
        spans::record_outcome(&span, "finished");

        if let Some(attempt) = self.attempt.as_mut() {
            let elapsed = metadata::time_delta_since(attempt.started_at);
            metadata::set_outcome_seconds(&mut attempt.metadata, keys::TIME_TO_PERFORM, elapsed);
            attempt.context.merge_into(&mut attempt.metadata);
        }
        if let Some(attempt) = &self.attempt {
            self.instrumentation
                .publish(&self.event(EventType::PerformFinished, &attempt.metadata));
        }
        outcome
    }

    async fn fail(&mut self, error: &JobError) {
        self.inner.fail(error).await;

        if !self.instrumentation.is_enabled() {
            return;
        }
        // Fail without a prior perform on this instance: start from the
        // payload and report zero time to perform.
        let (mut metadata, started_at, context) = match &self.attempt {
            Some(attempt) => (
                attempt.metadata.clone(),
                Some(attempt.started_at),
                Some(attempt.context.clone()),
            ),
            None => match self.inner.payload().metadata.clone() {
                Some(mut metadata) => {
                    metadata::stamp_origin(&mut metadata, Stage::Performed);
                    (metadata, None, None)
                }
                None => return,
            },
        };

        let elapsed = started_at.map_or(0.0, metadata::time_delta_since);
        metadata::set_outcome_seconds(&mut metadata, keys::TIME_TO_PERFORM, elapsed);
        metadata::set_outcome(&mut metadata, keys::EXCEPTION, Value::from(error.kind.clone()));
        metadata::set_outcome(&mut metadata, keys::MESSAGE, Value::from(error.message.clone()));
        metadata::set_outcome(
            &mut metadata,
            keys::BACKTRACE,
            Value::from(error.backtrace.clone()),
        );
        if let Some(context) = &context {
            context.merge_into(&mut metadata);
        }

        self.instrumentation
            .publish(&self.event(EventType::Failed, &metadata));
    }
}
