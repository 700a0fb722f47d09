//! SQLite-backed message queue for durable completions.
//!
//! Messages move `ready -> reserved -> done`, or back to `ready` on a nack,
//! or to `dead` once their attempts are exhausted. A `reserved` message whose
//! lease has expired is handed out again, which is what makes delivery
//! at-least-once when a worker dies mid-message.

use super::{Database, now_ms};
use crate::scheduler::queue::{Broker, QueueMessage, QueueStats};
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use std::time::Duration;

impl Database {
    /// Publish a message that becomes deliverable at `available_at` (ms).
    pub fn publish_message(
        &self,
        queue: &str,
        task_name: &str,
        payload: &serde_json::Value,
        available_at: i64,
    ) -> Result<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let now = now_ms();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_messages (queue, task_name, payload, status, attempts, available_at, created_at)
                 VALUES (?1, ?2, ?3, 'ready', 0, ?4, ?5)",
                params![queue, task_name, payload_json, available_at, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Claim the oldest due message on `queue` and lease it for `visibility`.
    pub fn reserve_message(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>> {
        let now = now_ms();
        let lease_until = now + visibility.as_millis() as i64;

        self.with_conn_mut(|conn| {
            // Take the write lock up front so a concurrent claimer waits on
            // busy_timeout instead of failing the read-to-write upgrade.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let candidate: Option<(i64, String, String, u32)> = tx
                .query_row(
                    "SELECT id, task_name, payload, attempts FROM queue_messages
                     WHERE queue = ?1
                       AND ((status = 'ready' AND available_at <= ?2)
                         OR (status = 'reserved' AND reserved_until <= ?2))
                     ORDER BY available_at ASC, id ASC
                     LIMIT 1",
                    params![queue, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((id, task_name, payload, attempts)) = candidate else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE queue_messages
                 SET status = 'reserved', reserved_until = ?1, attempts = attempts + 1
                 WHERE id = ?2",
                params![lease_until, id],
            )?;
            tx.commit()?;

            Ok(Some(QueueMessage {
                id,
                queue: queue.to_string(),
                task_name,
                payload,
                attempt: attempts + 1,
            }))
        })
    }

    /// Mark a message as processed.
    pub fn ack_message(&self, id: i64) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE queue_messages
                 SET status = 'done', reserved_until = NULL, finished_at = ?1
                 WHERE id = ?2 AND status = 'reserved'",
                params![now, id],
            )?;
            Ok(updated > 0)
        })
    }

    /// Return a message for redelivery after `retry_after`, or dead-letter it
    /// once `max_attempts` have been made. Returns true when dead-lettered.
    pub fn nack_message(
        &self,
        id: i64,
        error: &str,
        retry_after: Duration,
        max_attempts: u32,
    ) -> Result<bool> {
        let now = now_ms();
        let available_at = now + retry_after.as_millis() as i64;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let attempts: Option<u32> = tx
                .query_row(
                    "SELECT attempts FROM queue_messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(attempts) = attempts else {
                return Ok(false);
            };

            let dead = attempts >= max_attempts;
            if dead {
                tx.execute(
                    "UPDATE queue_messages
                     SET status = 'dead', reserved_until = NULL, last_error = ?1, finished_at = ?2
                     WHERE id = ?3",
                    params![error, now, id],
                )?;
            } else {
                tx.execute(
                    "UPDATE queue_messages
                     SET status = 'ready', reserved_until = NULL, last_error = ?1, available_at = ?2
                     WHERE id = ?3",
                    params![error, available_at, id],
                )?;
            }
            tx.commit()?;
            Ok(dead)
        })
    }

    /// Dead-letter a message immediately (e.g. an undecodable payload).
    pub fn bury_message(&self, id: i64, error: &str) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE queue_messages
                 SET status = 'dead', reserved_until = NULL, last_error = ?1, finished_at = ?2
                 WHERE id = ?3",
                params![error, now, id],
            )?;
            Ok(())
        })
    }

    /// Delete `done` and `dead` messages on `queue` that finished at least
    /// `retention` ago. Returns the number removed.
    pub fn purge_finished(&self, queue: &str, retention: Duration) -> Result<usize> {
        let cutoff = now_ms() - retention.as_millis() as i64;
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM queue_messages
                 WHERE queue = ?1 AND status IN ('done', 'dead') AND finished_at <= ?2",
                params![queue, cutoff],
            )?;
            Ok(removed)
        })
    }

    /// Count messages on `queue` by state.
    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM queue_messages WHERE queue = ?1 GROUP BY status",
            )?;
            let mut stats = QueueStats::default();
            let rows = stmt.query_map(params![queue], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                let count = count as u64;
                match status.as_str() {
                    "ready" => stats.ready = count,
                    "reserved" => stats.reserved = count,
                    "done" => stats.done = count,
                    "dead" => stats.dead = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }
}

#[async_trait]
impl Broker for Database {
    async fn publish(
        &self,
        queue: &str,
        task_name: &str,
        payload: serde_json::Value,
        available_at: i64,
    ) -> Result<i64> {
        self.publish_message(queue, task_name, &payload, available_at)
    }

    async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>> {
        self.reserve_message(queue, visibility)
    }

    async fn ack(&self, id: i64) -> Result<()> {
        self.ack_message(id)?;
        Ok(())
    }

    async fn nack(&self, id: i64, error: &str, retry_after: Duration, max_attempts: u32) -> Result<bool> {
        self.nack_message(id, error, retry_after, max_attempts)
    }

    async fn bury(&self, id: i64, error: &str) -> Result<()> {
        self.bury_message(id, error)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.queue_stats(queue)
    }

    async fn purge(&self, queue: &str, retention: Duration) -> Result<u64> {
        Ok(self.purge_finished(queue, retention)? as u64)
    }
}
