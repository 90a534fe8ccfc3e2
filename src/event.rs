//! Lifecycle events emitted by the interceptors.
//!
//! One event per transition of a job instance. Events sharing an
//! `event_hash` in their metadata belong to the same instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Item, Metadata};

/// A structured lifecycle event handed to publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub event_type: EventType,
    /// When it happened (ISO-8601 UTC on the wire).
    pub timestamp: DateTime<Utc>,
    /// Queue the job instance belongs to.
    pub queue: String,
    /// Snapshot of the instance's metadata at this transition.
    pub metadata: Metadata,
    pub worker_class: String,
    pub args: Vec<Value>,
}

impl LifecycleEvent {
    /// Build an event for `item` stamped with the current time.
    pub fn for_item(event_type: EventType, queue: &str, item: &Item) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            queue: queue.to_string(),
            metadata: item.metadata.clone().unwrap_or_default(),
            worker_class: item.worker_class.clone(),
            args: item.args.clone(),
        }
    }

    /// The correlation id, if the metadata carries one.
    pub fn event_hash(&self) -> Option<&str> {
        self.metadata
            .get(crate::metadata::keys::EVENT_HASH)
            .and_then(Value::as_str)
    }
}

/// Lifecycle transitions of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Entered a queue.
    Enqueued,
    /// Left a queue for execution.
    Dequeued,
    /// Discarded from a queue without being performed.
    Destroyed,
    /// About to be performed.
    PerformStarted,
    /// Performed successfully.
    PerformFinished,
    /// Perform raised an error.
    Failed,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Enqueued,
        EventType::Dequeued,
        EventType::Destroyed,
        EventType::PerformStarted,
        EventType::PerformFinished,
        EventType::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Enqueued => "enqueued",
            EventType::Dequeued => "dequeued",
            EventType::Destroyed => "destroyed",
            EventType::PerformStarted => "perform_started",
            EventType::PerformFinished => "perform_finished",
            EventType::Failed => "failed",
        }
    }

    /// Is this the last event an instance can emit?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::PerformFinished | EventType::Failed | EventType::Destroyed
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::error::Error::Other(format!("unknown event type: {s}")))
    }
}
