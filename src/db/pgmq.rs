//! pgmq queue operations via direct SQLx, and the pgmq queue transport.
//!
//! Calls pgmq's SQL functions (pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.delete). Selective removal has no pgmq function and
//! deletes from the queue table directly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::Value;

use super::Db;
use crate::error::{Error, Result};
use crate::model::Item;
use crate::queue::QueueTransport;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub vt: DateTime<Utc>,
    pub message: Value,
}

type MessageRow = (i64, i32, DateTime<Utc>, DateTime<Utc>, Value);

fn count_operation(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// pgmq keeps each queue in a table named after it; only plain identifiers
/// are safe to splice into SQL.
fn queue_table(queue_name: &str) -> Result<String> {
    let valid = !queue_name.is_empty()
        && queue_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(format!("pgmq.q_{queue_name}"))
    } else {
        Err(Error::Transport(format!("invalid queue name {queue_name:?}")))
    }
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        count_operation(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue and return its id.
    /// `delay_seconds` postpones visibility; 0 delivers immediately.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await?;
        count_operation(queue_name, "send");
        Ok(msg_id)
    }

    /// Read the next visible message, hiding it for `vt_seconds`.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });
        count_operation(
            queue_name,
            if msg.is_some() { "read" } else { "read_empty" },
        );
        Ok(msg)
    }

    /// Move a message to the queue's archive table.
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        count_operation(queue_name, "archive");
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        count_operation(queue_name, "delete");
        Ok(())
    }

    /// Delete every message whose `worker_class` matches (and whose `args`
    /// equal `args`, when given). Returns the deleted payloads.
    pub async fn delete_matching(
        &self,
        queue_name: &str,
        worker_class: &str,
        args: Option<&[Value]>,
    ) -> Result<Vec<Value>> {
        let table = queue_table(queue_name)?;
        let sql = format!(
            "DELETE FROM {table} \
             WHERE message->>'worker_class' = $1 \
               AND ($2::jsonb IS NULL OR message->'args' = $2::jsonb) \
             RETURNING message"
        );
        let args = args.map(|args| Value::Array(args.to_vec()));
        let rows: Vec<(Value,)> = sqlx::query_as(&sql)
            .bind(worker_class)
            .bind(args)
            .fetch_all(self.pool())
            .await?;
        count_operation(queue_name, "destroy");
        Ok(rows.into_iter().map(|(message,)| message).collect())
    }
}

/// Queue transport over pgmq.
///
/// `pop` reads with a visibility timeout and deletes the message once it
/// has been decoded, so a crash in between makes it visible again.
pub struct PgmqTransport {
    db: Arc<Db>,
    visibility_timeout: i32,
}

impl PgmqTransport {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            visibility_timeout: 30,
        }
    }

    /// Visibility timeout for reads, in seconds.
    pub fn visibility_timeout(mut self, seconds: i32) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }
}

#[async_trait]
impl QueueTransport for PgmqTransport {
    async fn push(&self, queue: &str, item: Item) -> Result<()> {
        let payload = serde_json::to_value(&item)?;
        self.db.send_to_queue(queue, &payload, 0).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Item>> {
        let Some(msg) = self.db.read_from_queue(queue, self.visibility_timeout).await? else {
            return Ok(None);
        };
        match serde_json::from_value::<Item>(msg.message) {
            Ok(item) => {
                self.db.delete_message(queue, msg.msg_id).await?;
                Ok(Some(item))
            }
            Err(e) => {
                // Undecodable payloads are parked in the archive.
                tracing::warn!(queue, msg_id = msg.msg_id, "archiving undecodable message: {e}");
                self.db.archive_message(queue, msg.msg_id).await?;
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
        self.db
            .delete_matching(queue, worker_class, args)
            .await?
            .into_iter()
            .map(|payload| serde_json::from_value(payload).map_err(Into::into))
            .collect()
    }
}
