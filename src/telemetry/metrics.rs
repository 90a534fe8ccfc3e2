//! Metric instrument factories for jobtrail.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobtrail"` meter; without a
//! provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobtrail instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobtrail")
}

/// Counter: lifecycle events accepted by the configured publisher.
/// Labels: `event_type`.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.events.published")
        .with_description("Number of lifecycle events published")
        .build()
}

/// Counter: publisher failures (errors or panics), including composite children.
/// Labels: `publisher`, `event_type`.
pub fn publish_failures() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.publish.failures")
        .with_description("Number of lifecycle events a publisher failed to take")
        .build()
}

/// Counter: dequeued items carrying no metadata (enqueued uninstrumented).
/// Labels: `queue`.
pub fn items_uninstrumented() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.items.uninstrumented")
        .with_description("Number of dequeued items without instrumentation metadata")
        .build()
}

/// Counter: queue-level operations (create, send, read, delete, archive, destroy).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: jobs recorded as failed by the job runner.
/// Labels: `queue`, `worker_class`.
pub fn jobs_failed() -> Counter<u64> {
    meter()
        .u64_counter("jobtrail.jobs.failed")
        .with_description("Number of failed job performs")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobtrail.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
