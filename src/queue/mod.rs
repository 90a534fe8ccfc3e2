//! Queue transport capability and the queue interceptor.
//!
//! [`QueueInterceptor`] wraps any [`QueueTransport`] and is itself one, so
//! callers swap it in where the bare transport was used. With the gate open
//! it stamps correlation metadata on push, computes time-in-queue on pop,
//! and publishes `enqueued`, `dequeued` and `destroyed` events.

pub mod memory;

pub use memory::MemoryTransport;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{EventType, LifecycleEvent};
use crate::instrument::Instrumentation;
use crate::metadata::{self, Stage, keys};
use crate::model::Item;
use crate::telemetry::metrics;

/// The primitives required of a durable queue.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Append `item` to `queue`.
    async fn push(&self, queue: &str, item: Item) -> Result<()>;

    /// Remove and return the next item of `queue`, `None` when empty.
    async fn pop(&self, queue: &str) -> Result<Option<Item>>;

    /// Remove every item of `worker_class` (with exactly `args`, when given)
    /// from `queue` and return them.
    async fn destroy(
        &self,
        queue: &str,
        worker_class: &str,
        args: Option<&[Value]>,
    ) -> Result<Vec<Item>> {
        let _ = (queue, worker_class, args);
        Err(Error::Unsupported("destroy".to_string()))
    }
}

#[async_trait]
impl<T: QueueTransport + ?Sized> QueueTransport for Arc<T> {
    async fn push(&self, queue: &str, item: Item) -> Result<()> {
        (**self).push(queue, item).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Item>> {
        (**self).pop(queue).await
    }

    async fn destroy(
        &self,
        queue: &str,
        worker_class: &str,
        args: Option<&[Value]>,
    ) -> Result<Vec<Item>> {
        (**self).destroy(queue, worker_class, args).await
    }
}

/// Instrumenting wrapper around a queue transport.
pub struct QueueInterceptor<T> {
    inner: T,
    instrumentation: Arc<Instrumentation>,
}

impl<T: QueueTransport> QueueInterceptor<T> {
    pub fn new(inner: T, instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            inner,
            instrumentation,
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.instrumentation
    }
}

#[async_trait]
impl<T: QueueTransport> QueueTransport for QueueInterceptor<T> {
    async fn push(&self, queue: &str, mut item: Item) -> Result<()> {
        if !self.instrumentation.is_enabled() {
            return self.inner.push(queue, item).await;
        }

        // Stamped fields win over anything the caller put there; other
        // caller keys are kept.
        let mut stamped = item.metadata.take().unwrap_or_default();
        stamped.extend(metadata::enqueue_metadata());
        item.metadata = Some(stamped);

        self.instrumentation.preprocess(queue, &mut item);
        self.instrumentation
            .publish(&LifecycleEvent::for_item(EventType::Enqueued, queue, &item));

        self.inner.push(queue, item).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Item>> {
        let Some(mut item) = self.inner.pop(queue).await? else {
            return Ok(None);
        };
        if !self.instrumentation.is_enabled() {
            return Ok(Some(item));
        }
        let Some(meta) = item.metadata.as_mut() else {
            tracing::debug!(
                queue,
                worker_class = %item.worker_class,
                "dequeued item has no metadata, skipping"
            );
            metrics::items_uninstrumented().add(1, &[KeyValue::new("queue", queue.to_string())]);
            return Ok(Some(item));
        };

        metadata::stamp_origin(meta, Stage::Dequeued);
        let time_in_queue = meta
            .get(keys::ENQUEUED_TIME)
            .and_then(Value::as_f64)
            .map(metadata::time_delta_since)
            .unwrap_or(0.0);
        metadata::set_seconds(meta, keys::TIME_IN_QUEUE, time_in_queue);

        self.instrumentation
            .publish(&LifecycleEvent::for_item(EventType::Dequeued, queue, &item));
        Ok(Some(item))
    }

    async fn destroy(
        &self,
        queue: &str,
        worker_class: &str,
        args: Option<&[Value]>,
    ) -> Result<Vec<Item>> {
        let mut removed = self.inner.destroy(queue, worker_class, args).await?;
        if !self.instrumentation.is_enabled() {
            return Ok(removed);
        }
        for item in &mut removed {
            let Some(meta) = item.metadata.as_mut() else {
                continue;
            };
            metadata::stamp_current(meta);
            self.instrumentation
                .publish(&LifecycleEvent::for_item(EventType::Destroyed, queue, item));
        }
        Ok(removed)
    }
}
