//! Publisher that writes one log record per event.
//!
//! Two backends:
//! - [`LogPublisher::tracing`] emits through `tracing` under the
//!   `jobtrail::events` target, so level filtering, formatting and file
//!   rotation are whatever the installed subscriber does.
//! - [`LogPublisher::file`] appends marshalled records to a file and can
//!   [`reopen`](LogPublisher::reopen) it after an external rotation
//!   (logrotate-style move + signal).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::Level;

use super::Publisher;
use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::marshal::{JsonLines, Marshaller};

/// `tracing` target used for event records.
pub const EVENTS_TARGET: &str = "jobtrail::events";

enum Backend {
    Tracing(Level),
    File { path: PathBuf, file: Mutex<File> },
}

/// Encodes with its own marshaller when given one, else with the
/// instrumentation's (or [`JsonLines`] when published to directly).
pub struct LogPublisher {
    backend: Backend,
    marshaller: Option<Arc<dyn Marshaller>>,
}

impl LogPublisher {
    /// Emit records through `tracing` at `level`.
    pub fn tracing(level: Level) -> Self {
        Self {
            backend: Backend::Tracing(level),
            marshaller: None,
        }
    }

    /// Append records to the file at `path`, creating it if needed.
    pub fn file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self {
            backend: Backend::File {
                path,
                file: Mutex::new(file),
            },
            marshaller: None,
        })
    }

    pub fn marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = Some(marshaller);
        self
    }

    /// Reopen the log file at its configured path. A no-op for the
    /// `tracing` backend.
    pub fn reopen(&self) -> Result<()> {
        if let Backend::File { path, file } = &self.backend {
            let reopened = open_append(path)?;
            *file.lock().unwrap_or_else(PoisonError::into_inner) = reopened;
            tracing::debug!(path = %path.display(), "event log reopened");
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

impl Publisher for LogPublisher {
    fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        self.publish_with(event, &JsonLines)
    }

    fn publish_with(&self, event: &LifecycleEvent, marshaller: &dyn Marshaller) -> Result<()> {
        let record = match &self.marshaller {
            Some(own) => own.marshal(event)?,
            None => marshaller.marshal(event)?,
        };
        match &self.backend {
            Backend::Tracing(level) => {
                let line = String::from_utf8_lossy(record.trim_ascii_end());
                let event_type = event.event_type.as_str();
                match *level {
                    Level::ERROR => tracing::error!(target: EVENTS_TARGET, event_type, "{line}"),
                    Level::WARN => tracing::warn!(target: EVENTS_TARGET, event_type, "{line}"),
                    Level::INFO => tracing::info!(target: EVENTS_TARGET, event_type, "{line}"),
                    Level::DEBUG => tracing::debug!(target: EVENTS_TARGET, event_type, "{line}"),
                    _ => tracing::trace!(target: EVENTS_TARGET, event_type, "{line}"),
                }
            }
            Backend::File { file, .. } => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                file.write_all(&record)?;
                file.flush()?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        match self.backend {
            Backend::Tracing(_) => "log:tracing",
            Backend::File { .. } => "log:file",
        }
    }
}
