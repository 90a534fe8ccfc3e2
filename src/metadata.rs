//! Metadata builder: correlation ids, host/process identity, timing.
//!
//! Everything here is a pure function of the environment and the clock.
//! Durations are floating-point seconds and are clamped at zero, since the
//! enqueueing and consuming processes may disagree about the time.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::Metadata;

/// Metadata keys written by the pipeline.
pub mod keys {
    pub const EVENT_HASH: &str = "event_hash";
    pub const HOSTNAME: &str = "hostname";
    pub const PROCESS: &str = "process";
    pub const ENQUEUED_TIME: &str = "enqueued_time";
    pub const TIME_IN_QUEUE: &str = "time_in_queue";
    pub const TIME_TO_PERFORM: &str = "time_to_perform";
    pub const EXCEPTION: &str = "exception";
    pub const MESSAGE: &str = "message";
    pub const BACKTRACE: &str = "backtrace";
}

/// Pipeline stage that touched an item, for stage-specific identity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Enqueued,
    Dequeued,
    Performed,
}

impl Stage {
    fn prefix(self) -> &'static str {
        match self {
            Stage::Enqueued => "enqueued",
            Stage::Dequeued => "dequeued",
            Stage::Performed => "performed",
        }
    }

    pub fn hostname_key(self) -> String {
        format!("{}_hostname", self.prefix())
    }

    pub fn process_key(self) -> String {
        format!("{}_process", self.prefix())
    }
}

/// Namespace for name-based correlation ids.
const EVENT_HASH_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6a, 0x6f, 0x62, 0x74, 0x72, 0x61, 0x69, 0x6c, 0x2d, 0x65, 0x76, 0x65, 0x6e, 0x74, 0x73, 0x21,
]);

/// A unique correlation id for a new job instance.
///
/// SHA-1 name-based digest over hostname, process id and a nanosecond
/// timestamp, rendered as 32 lowercase hex characters.
pub fn event_hash() -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000));
    let name = format!("{}{}{}", hostname(), process(), nanos);
    Uuid::new_v5(&EVENT_HASH_NAMESPACE, name.as_bytes())
        .simple()
        .to_string()
}

/// The hostname of the machine this process runs on.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(resolve_hostname)
}

fn resolve_hostname() -> String {
    let candidates = [
        std::env::var("HOSTNAME").ok(),
        std::fs::read_to_string("/proc/sys/kernel/hostname").ok(),
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok()),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The current process id.
pub fn process() -> u32 {
    std::process::id()
}

/// Seconds since the Unix epoch, with microsecond resolution.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

pub fn now_epoch_seconds() -> f64 {
    epoch_seconds(Utc::now())
}

/// Returns `delta` if it is non-negative, else `0.0`.
pub fn clamp_nonnegative(delta: f64) -> f64 {
    if delta >= 0.0 { delta } else { 0.0 }
}

/// Seconds elapsed since `start` (epoch seconds), never negative.
pub fn time_delta_since(start: f64) -> f64 {
    clamp_nonnegative(now_epoch_seconds() - start)
}

/// Stamp the current host and process onto `metadata` for `stage`.
///
/// `hostname`/`process` always describe the latest stage; the stage-specific
/// keys keep every stage's identity side by side.
pub fn stamp_origin(metadata: &mut Metadata, stage: Stage) {
    metadata.insert(stage.hostname_key(), Value::from(hostname()));
    metadata.insert(stage.process_key(), Value::from(process()));
    stamp_current(metadata);
}

/// Stamp the current host and process as the latest stage's identity.
pub fn stamp_current(metadata: &mut Metadata) {
    metadata.insert(keys::HOSTNAME.to_string(), Value::from(hostname()));
    metadata.insert(keys::PROCESS.to_string(), Value::from(process()));
}

/// Fresh metadata for an item entering a queue.
pub fn enqueue_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(keys::EVENT_HASH.to_string(), Value::from(event_hash()));
    stamp_origin(&mut metadata, Stage::Enqueued);
    metadata.insert(
        keys::ENQUEUED_TIME.to_string(),
        Value::from(now_epoch_seconds()),
    );
    metadata
}

/// Record a duration in seconds under `key`.
pub fn set_seconds(metadata: &mut Metadata, key: &str, seconds: f64) {
    // Non-finite values have no JSON representation.
    let value = serde_json::Number::from_f64(seconds)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0.0));
    metadata.insert(key.to_string(), value);
}

/// Record a perform outcome under `key` and under its underscore-prefixed
/// shadow (`time_to_perform` and `_time_to_perform`, ...).
pub fn set_outcome(metadata: &mut Metadata, key: &str, value: Value) {
    metadata.insert(format!("_{key}"), value.clone());
    metadata.insert(key.to_string(), value);
}

/// [`set_seconds`] plus the underscore-prefixed shadow.
pub fn set_outcome_seconds(metadata: &mut Metadata, key: &str, seconds: f64) {
    set_seconds(metadata, key, seconds);
    if let Some(value) = metadata.get(key).cloned() {
        metadata.insert(format!("_{key}"), value);
    }
}
