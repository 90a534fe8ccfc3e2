//! # jobtrail
//!
//! Lifecycle event instrumentation for queue-based job pipelines.
//!
//! Wraps a queue transport and a job runner with interceptors that stamp
//! correlation metadata onto every queued item and publish `enqueued`,
//! `dequeued`, `perform_started`, `perform_finished`, `failed` and
//! `destroyed` events to pluggable sinks. Ships an in-memory and a pgmq
//! (Postgres) transport, a minimal worker, and OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod instrument;
pub mod job;
pub mod marshal;
pub mod metadata;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod telemetry;

pub use event::{EventType, LifecycleEvent};
pub use instrument::Instrumentation;
pub use model::{Item, Metadata};
