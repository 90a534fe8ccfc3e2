//! Publisher that writes marshalled events to a byte stream.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use super::Publisher;
use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::marshal::{JsonLines, Marshaller};

/// Writes each event as one marshalled record to a `Write` sink
/// (stdout, a file, a socket, an in-memory buffer).
///
/// Writes are serialized by a mutex, so records from concurrent publishers
/// sharing one instance never interleave.
///
/// Without a marshaller of its own the sink encodes with the one its
/// instrumentation passes in, or [`JsonLines`] when published to directly.
pub struct StreamPublisher {
    name: String,
    writer: Mutex<Box<dyn Write + Send>>,
    marshaller: Option<Arc<dyn Marshaller>>,
}

impl StreamPublisher {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            name: "stream".to_string(),
            writer: Mutex::new(Box::new(writer)),
            marshaller: None,
        }
    }

    pub fn with_marshaller(
        writer: impl Write + Send + 'static,
        marshaller: Arc<dyn Marshaller>,
    ) -> Self {
        Self::new(writer).marshaller(marshaller)
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout()).named("stdout")
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr()).named("stderr")
    }

    /// Override the name used in failure reports.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pin the encoding, ignoring the instrumentation's marshaller.
    pub fn marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = Some(marshaller);
        self
    }
}

impl Publisher for StreamPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        self.publish_with(event, &JsonLines)
    }

    fn publish_with(&self, event: &LifecycleEvent, marshaller: &dyn Marshaller) -> Result<()> {
        let record = match &self.marshaller {
            Some(own) => own.marshal(event)?,
            None => marshaller.marshal(event)?,
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&record)?;
        writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
