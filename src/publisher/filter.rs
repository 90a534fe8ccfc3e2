//! In-memory publisher that records events and exposes filtered views.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Publisher;
use crate::error::Result;
use crate::event::{EventType, LifecycleEvent};

/// Predicate over recorded events.
pub type EventFilter = Arc<dyn Fn(&LifecycleEvent) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    events: Vec<LifecycleEvent>,
    filters: Vec<EventFilter>,
}

/// Records every event it receives.
///
/// [`filtered_events`](Self::filtered_events) returns the recorded events
/// matching every active filter. Filters apply to events already recorded
/// and to those arriving later, until [`clear_filters`](Self::clear_filters).
#[derive(Default)]
pub struct FilterPublisher {
    inner: Mutex<Inner>,
}

impl FilterPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a filter. Returns `self` so filters can be chained.
    pub fn filter(
        &self,
        predicate: impl Fn(&LifecycleEvent) -> bool + Send + Sync + 'static,
    ) -> &Self {
        self.lock().filters.push(Arc::new(predicate));
        self
    }

    pub fn clear_filters(&self) {
        self.lock().filters.clear();
    }

    pub fn filter_count(&self) -> usize {
        self.lock().filters.len()
    }

    /// Everything received, in arrival order.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.lock().events.clone()
    }

    /// Received events matching all filters, in arrival order.
    pub fn filtered_events(&self) -> Vec<LifecycleEvent> {
        let inner = self.lock();
        inner
            .events
            .iter()
            .filter(|event| inner.filters.iter().all(|f| f(event)))
            .cloned()
            .collect()
    }

    /// Received events carrying `event_hash`, in arrival order.
    pub fn events_for(&self, event_hash: &str) -> Vec<LifecycleEvent> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.event_hash() == Some(event_hash))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn clear(&self) {
        self.lock().events.clear();
    }
}

impl Publisher for FilterPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "filter"
    }
}

pub fn queue_is(queue: impl Into<String>) -> impl Fn(&LifecycleEvent) -> bool + Send + Sync {
    let queue = queue.into();
    move |event| event.queue == queue
}

pub fn event_type_is(event_type: EventType) -> impl Fn(&LifecycleEvent) -> bool + Send + Sync {
    move |event| event.event_type == event_type
}

pub fn worker_class_is(
    worker_class: impl Into<String>,
) -> impl Fn(&LifecycleEvent) -> bool + Send + Sync {
    let worker_class = worker_class.into();
    move |event| event.worker_class == worker_class
}
