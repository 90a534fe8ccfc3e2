//! Fan-out publisher with per-child failure isolation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use opentelemetry::KeyValue;

use super::Publisher;
use crate::error::Result;
use crate::event::{EventType, LifecycleEvent};
use crate::marshal::{JsonLines, Marshaller};
use crate::telemetry::metrics;

/// A child publisher that failed to take an event.
#[derive(Debug, Clone)]
pub struct ChildFailure {
    /// Position of the child in the composite.
    pub index: usize,
    /// The child's [`Publisher::name`].
    pub publisher: String,
    pub event_type: EventType,
    pub event_hash: Option<String>,
    /// Error message, or the panic payload when the child panicked.
    pub error: String,
}

/// Receives child failures. The default logs them and counts them.
pub type ErrorReporter = Arc<dyn Fn(&ChildFailure) + Send + Sync>;

/// Delivers every event to each child, in order.
///
/// A child returning an error or panicking is reported through the
/// [`ErrorReporter`]; the remaining children still receive the event and the
/// composite itself always returns `Ok`. There is no retry.
pub struct CompositePublisher {
    children: Vec<Arc<dyn Publisher>>,
    reporter: ErrorReporter,
}

impl Default for CompositePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositePublisher {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            reporter: Arc::new(log_child_failure),
        }
    }

    /// Append a child.
    pub fn add(&mut self, child: Arc<dyn Publisher>) {
        self.children.push(child);
    }

    /// Builder form of [`add`](Self::add).
    pub fn with(mut self, child: Arc<dyn Publisher>) -> Self {
        self.add(child);
        self
    }

    /// Replace the failure reporter.
    pub fn on_error(mut self, reporter: impl Fn(&ChildFailure) + Send + Sync + 'static) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[Arc<dyn Publisher>] {
        &self.children
    }
}

impl Publisher for CompositePublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        self.publish_with(event, &JsonLines)
    }

    fn publish_with(&self, event: &LifecycleEvent, marshaller: &dyn Marshaller) -> Result<()> {
        for (index, child) in self.children.iter().enumerate() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| child.publish_with(event, marshaller)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(&*panic),
            };
            let failure = ChildFailure {
                index,
                publisher: child.name().to_string(),
                event_type: event.event_type,
                event_hash: event.event_hash().map(str::to_string),
                error,
            };
            // A panicking reporter must not stop delivery to later children.
            let _ = catch_unwind(AssertUnwindSafe(|| (self.reporter)(&failure)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "composite"
    }
}

/// Default reporter: a warn-level log line plus a failure counter.
pub fn log_child_failure(failure: &ChildFailure) {
    tracing::warn!(
        publisher = %failure.publisher,
        index = failure.index,
        event_type = %failure.event_type,
        event_hash = failure.event_hash.as_deref().unwrap_or("-"),
        error = %failure.error,
        "error publishing event to child publisher"
    );
    metrics::publish_failures().add(
        1,
        &[
            KeyValue::new("publisher", failure.publisher.clone()),
            KeyValue::new("event_type", failure.event_type.as_str()),
        ],
    );
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
