//! In-process queue transport.
//!
//! FIFO per queue name behind a mutex. Items are stored serialized, the way
//! an external broker would hold them, so anything that would not survive
//! the wire does not survive here either. Payloads that do not decode as an
//! [`Item`] are moved, unchanged, to a per-queue archive.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::QueueTransport;
use crate::error::Result;
use crate::model::Item;

#[derive(Debug, Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    archive: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Value>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items waiting in `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Store a raw payload as-is, bypassing `Item` serialization. Useful for
    /// simulating producers that do not know about metadata.
    pub fn push_raw(&self, queue: &str, payload: Value) {
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Payloads of `queue` that failed to decode, oldest first.
    pub fn archived(&self, queue: &str) -> Vec<Value> {
        self.archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// The raw stored payloads of `queue`, head first.
    pub fn peek_raw(&self, queue: &str) -> Vec<Value> {
        self.lock()
            .get(queue)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn push(&self, queue: &str, item: Item) -> Result<()> {
        let payload = serde_json::to_value(&item)?;
        self.push_raw(queue, payload);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Item>> {
        let mut queues = self.lock();
        let Some(stored) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(head) = stored.front() else {
            return Ok(None);
        };
        match Item::deserialize(head) {
            Ok(item) => {
                stored.pop_front();
                Ok(Some(item))
            }
            Err(e) => {
                tracing::warn!(queue, "archiving undecodable payload: {e}");
                if let Some(payload) = stored.pop_front() {
                    self.archive
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(queue.to_string())
                        .or_default()
                        .push(payload);
                }
                Err(e.into())
            }
        }
    }

    async fn destroy(
        &self,
        queue: &str,
        worker_class: &str,
        args: Option<&[Value]>,
    ) -> Result<Vec<Item>> {
        let mut queues = self.lock();
        let Some(stored) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut kept = VecDeque::with_capacity(stored.len());
        let mut removed = Vec::new();
        for payload in stored.drain(..) {
            match serde_json::from_value::<Item>(payload.clone()) {
                Ok(item) if item.matches(worker_class, args) => removed.push(item),
                _ => kept.push_back(payload),
            }
        }
        *stored = kept;
        Ok(removed)
    }
}
