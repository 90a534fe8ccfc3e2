//! Publisher that discards everything.

use super::Publisher;
use crate::error::Result;
use crate::event::LifecycleEvent;

/// Discards events. Enables the pipeline (so metadata is still computed and
/// carried) without any external I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish(&self, _event: &LifecycleEvent) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}
