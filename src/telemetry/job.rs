//! Job execution span helpers.
//!
//! Provides span creation for job performs and a debug record for every
//! lifecycle event handed to a publisher.

use tracing::Span;

use crate::event::LifecycleEvent;

/// Start a span for one job perform.
///
/// The `job.outcome` field is declared empty and is filled via
/// [`record_outcome`].
pub fn start_perform_span(queue: &str, worker_class: &str, event_hash: Option<&str>) -> Span {
    tracing::info_span!(
        "job.perform",
        "messaging.destination.name" = queue,
        "job.worker_class" = worker_class,
        "job.event_hash" = event_hash.unwrap_or("-"),
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how a perform ended ("finished" | "failed") on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}

/// Emit a debug event describing a lifecycle event about to be published.
pub fn record_lifecycle_event(event: &LifecycleEvent) {
    tracing::debug!(
        event_type = %event.event_type,
        queue = %event.queue,
        worker_class = %event.worker_class,
        event_hash = event.event_hash().unwrap_or("-"),
        "lifecycle_event"
    );
}
