//! Instrumentation configuration and the enablement gate.
//!
//! An [`Instrumentation`] value is built once and shared (`Arc`) with the
//! interceptors. Without an event publisher the gate is closed and every
//! interceptor is a pure pass-through. There is no global state: several
//! configurations can live side by side in one process.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use opentelemetry::KeyValue;

use crate::event::LifecycleEvent;
use crate::marshal::{JsonLines, Marshaller};
use crate::model::{Item, Metadata};
use crate::publisher::Publisher;
use crate::publisher::composite::panic_message;
use crate::telemetry::{job as spans, metrics};

/// Hook run at enqueue, after the pipeline stamps its metadata and before
/// the `enqueued` event is published. It sees the item read-only and may
/// only change the metadata.
pub type ItemPreprocessor = Arc<dyn Fn(&str, &Item, &mut Metadata) + Send + Sync>;

pub struct Instrumentation {
    publisher: Option<Arc<dyn Publisher>>,
    preprocessor: Option<ItemPreprocessor>,
    marshaller: Arc<dyn Marshaller>,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("publisher", &self.publisher.as_ref().map(|p| p.name()))
            .field("preprocessor", &self.preprocessor.is_some())
            .finish()
    }
}

impl Instrumentation {
    pub fn builder() -> InstrumentationBuilder {
        InstrumentationBuilder::default()
    }

    /// A configuration with the gate closed.
    pub fn disabled() -> Self {
        Self {
            publisher: None,
            preprocessor: None,
            marshaller: Arc::new(JsonLines),
        }
    }

    /// Shorthand for an enabled configuration publishing to `publisher`.
    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self::builder().event_publisher(publisher).build()
    }

    /// The enablement gate.
    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn publisher(&self) -> Option<&Arc<dyn Publisher>> {
        self.publisher.as_ref()
    }

    /// Marshaller handed to byte-oriented sinks that have none of their own.
    pub fn marshaller(&self) -> &Arc<dyn Marshaller> {
        &self.marshaller
    }

    /// Run the item preprocessor, if any, against `item`'s metadata.
    ///
    /// A panicking preprocessor is logged and its partial changes kept; the
    /// enqueue goes ahead.
    pub(crate) fn preprocess(&self, queue: &str, item: &mut Item) {
        let Some(preprocessor) = &self.preprocessor else {
            return;
        };
        let mut metadata = item.metadata.take().unwrap_or_default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            preprocessor(queue, item, &mut metadata);
        }));
        item.metadata = Some(metadata);
        if let Err(panic) = outcome {
            tracing::warn!(
                queue,
                worker_class = %item.worker_class,
                error = %panic_message(&*panic),
                "item preprocessor failed"
            );
        }
    }

    /// Hand `event` to the configured publisher.
    ///
    /// Never fails and never panics: a publisher error degrades to the event
    /// not being published.
    pub fn publish(&self, event: &LifecycleEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        spans::record_lifecycle_event(event);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            publisher.publish_with(event, &*self.marshaller)
        }));
        let error = match outcome {
            Ok(Ok(())) => {
                metrics::events_published()
                    .add(1, &[KeyValue::new("event_type", event.event_type.as_str())]);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(&*panic),
        };
        tracing::warn!(
            publisher = publisher.name(),
            event_type = %event.event_type,
            queue = %event.queue,
            error = %error,
            "event not published"
        );
        metrics::publish_failures().add(
            1,
            &[
                KeyValue::new("publisher", publisher.name().to_string()),
                KeyValue::new("event_type", event.event_type.as_str()),
            ],
        );
    }
}

/// Builder for [`Instrumentation`].
#[derive(Default)]
pub struct InstrumentationBuilder {
    publisher: Option<Arc<dyn Publisher>>,
    preprocessor: Option<ItemPreprocessor>,
    marshaller: Option<Arc<dyn Marshaller>>,
}

impl InstrumentationBuilder {
    pub fn event_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Set the publisher from an optional value (e.g. built from settings).
    pub fn maybe_event_publisher(mut self, publisher: Option<Arc<dyn Publisher>>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn item_preprocessor(
        mut self,
        preprocessor: impl Fn(&str, &Item, &mut Metadata) + Send + Sync + 'static,
    ) -> Self {
        self.preprocessor = Some(Arc::new(preprocessor));
        self
    }

    pub fn event_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = Some(marshaller);
        self
    }

    pub fn build(self) -> Instrumentation {
        Instrumentation {
            publisher: self.publisher,
            preprocessor: self.preprocessor,
            marshaller: self.marshaller.unwrap_or_else(|| Arc::new(JsonLines)),
        }
    }
}
