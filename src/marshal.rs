//! Event marshallers: turn a lifecycle event into bytes for a sink.
//!
//! Publishers that write bytes take an `Arc<dyn Marshaller>`, so the
//! encoding can be swapped without touching publisher logic.

use crate::error::Result;
use crate::event::LifecycleEvent;

/// Encodes a lifecycle event for a byte-oriented sink.
pub trait Marshaller: Send + Sync {
    fn marshal(&self, event: &LifecycleEvent) -> Result<Vec<u8>>;
}

/// Default encoding: one compact JSON object per line, newline-terminated.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLines;

impl Marshaller for JsonLines {
    fn marshal(&self, event: &LifecycleEvent) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Any `Fn(&LifecycleEvent) -> Result<Vec<u8>>` is a marshaller.
impl<F> Marshaller for F
where
    F: Fn(&LifecycleEvent) -> Result<Vec<u8>> + Send + Sync,
{
    fn marshal(&self, event: &LifecycleEvent) -> Result<Vec<u8>> {
        self(event)
    }
}

/// Decode one record produced by [`JsonLines`].
pub fn unmarshal(bytes: &[u8]) -> Result<LifecycleEvent> {
    Ok(serde_json::from_slice(bytes.trim_ascii_end())?)
}
