//! Typed configuration from environment variables and a publisher file.
//!
//! Loads once at startup. Sensitive values are wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::Level;

use crate::error::{Error, Result};
use crate::instrument::Instrumentation;
use crate::marshal::Marshaller;
use crate::publisher::{
    CompositePublisher, LogPublisher, NoopPublisher, Publisher, StreamPublisher,
};

#[derive(Debug)]
pub struct Config {
    /// Postgres connection string; only needed by the pgmq transport.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// TOML file describing the event publishers.
    pub publishers_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            publishers_file: std::env::var("JOBTRAIL_PUBLISHERS").ok().map(PathBuf::from),
        })
    }

    /// The database URL, or a config error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }

    /// Publisher settings from `JOBTRAIL_PUBLISHERS`, or `fallback` when unset.
    pub fn publisher_settings(&self, fallback: PublisherSettings) -> Result<PublisherSettings> {
        match &self.publishers_file {
            Some(path) => PublisherSettings::load(path),
            None => Ok(fallback),
        }
    }
}

/// Kind of event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherKind {
    Stdout,
    Stderr,
    /// Append to a file at `path`.
    Log,
    /// Emit through `tracing` at `level`.
    Tracing,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublisherEntry {
    pub kind: PublisherKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<String>,
}

/// Event sinks, one `[[publisher]]` table each:
///
/// ```toml
/// [[publisher]]
/// kind = "stdout"
///
/// [[publisher]]
/// kind = "log"
/// path = "/var/log/jobtrail/events.log"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublisherSettings {
    #[serde(default, rename = "publisher")]
    pub publishers: Vec<PublisherEntry>,
}

impl PublisherSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// A single stdout sink.
    pub fn stdout() -> Self {
        Self {
            publishers: vec![PublisherEntry {
                kind: PublisherKind::Stdout,
                path: None,
                level: None,
            }],
        }
    }

    /// Build the configured sinks, all marshalling with `marshaller`.
    ///
    /// No entries yields `None` (instrumentation stays disabled); several
    /// entries are wrapped in a [`CompositePublisher`].
    pub fn build(&self, marshaller: Arc<dyn Marshaller>) -> Result<Option<Arc<dyn Publisher>>> {
        let mut sinks = self
            .publishers
            .iter()
            .map(|entry| entry.build(Arc::clone(&marshaller)))
            .collect::<Result<Vec<_>>>()?;
        match sinks.len() {
            0 => Ok(None),
            1 => Ok(sinks.pop()),
            _ => {
                let composite = sinks
                    .into_iter()
                    .fold(CompositePublisher::new(), CompositePublisher::with);
                Ok(Some(Arc::new(composite)))
            }
        }
    }

    /// Instrumentation publishing to the configured sinks. Disabled when
    /// there are none.
    pub fn instrumentation(&self, marshaller: Arc<dyn Marshaller>) -> Result<Instrumentation> {
        let publisher = self.build(Arc::clone(&marshaller))?;
        Ok(Instrumentation::builder()
            .maybe_event_publisher(publisher)
            .event_marshaller(marshaller)
            .build())
    }
}

impl PublisherEntry {
    fn build(&self, marshaller: Arc<dyn Marshaller>) -> Result<Arc<dyn Publisher>> {
        let publisher: Arc<dyn Publisher> = match self.kind {
            PublisherKind::Stdout => Arc::new(StreamPublisher::stdout().marshaller(marshaller)),
            PublisherKind::Stderr => Arc::new(StreamPublisher::stderr().marshaller(marshaller)),
            PublisherKind::Log => {
                let path = self.path.as_ref().ok_or_else(|| {
                    Error::Config("publisher kind \"log\" needs a path".to_string())
                })?;
                Arc::new(LogPublisher::file(path)?.marshaller(marshaller))
            }
            PublisherKind::Tracing => {
                let level = parse_level(self.level.as_deref().unwrap_or("info"))?;
                Arc::new(LogPublisher::tracing(level).marshaller(marshaller))
            }
            PublisherKind::Noop => Arc::new(NoopPublisher),
        };
        Ok(publisher)
    }
}

fn parse_level(level: &str) -> Result<Level> {
    level
        .parse()
        .map_err(|_| Error::Config(format!("unknown log level {level:?}")))
}
