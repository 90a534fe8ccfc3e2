//! Event publishers: sinks that receive lifecycle events.
//!
//! A publisher reports failure through its `Result`. The interceptors never
//! let that failure (or a panic) reach the queue or job caller, and the
//! [`CompositePublisher`] isolates each child from the others.
//!
//! Publishers may be called concurrently from many workers sharing one
//! instance; each implementation serializes its own writes.

pub mod composite;
pub mod filter;
pub mod log;
pub mod noop;
pub mod stream;

pub use composite::{ChildFailure, CompositePublisher, ErrorReporter};
pub use filter::FilterPublisher;
pub use log::LogPublisher;
pub use noop::NoopPublisher;
pub use stream::StreamPublisher;

use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::marshal::Marshaller;

/// A sink for lifecycle events.
pub trait Publisher: Send + Sync {
    /// Deliver one event. No durability is implied by `Ok`.
    fn publish(&self, event: &LifecycleEvent) -> Result<()>;

    /// Deliver one event, encoding it with `marshaller` unless the sink was
    /// given its own. Sinks that do not write bytes ignore the marshaller.
    fn publish_with(&self, event: &LifecycleEvent, _marshaller: &dyn Marshaller) -> Result<()> {
        self.publish(event)
    }

    /// Identity used when reporting failures.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
