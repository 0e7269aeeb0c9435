use crate::db::Database;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Durable FIFO work queue with a separate dead-letter list.
///
/// `pop` blocks up to a timeout: same-process pushes wake waiters through a
/// `Notify`; a short poll interval covers rows written by other processes.
#[derive(Clone)]
pub struct WorkQueue {
    db: Database,
    wake: Arc<Notify>,
    poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_message: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
}

impl WorkQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            wake: Arc::new(Notify::new()),
            poll_interval: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Append a payload to the queue tail.
    pub async fn push(&self, payload: &str) -> Result<i64> {
        let payload = payload.to_string();
        let id = self
            .db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue (payload, enqueued_at) VALUES (?1, ?2)",
                    params![payload, Utc::now().to_rfc3339()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Pop the oldest queued message, waiting up to `timeout` for one to
    /// arrive. Returns `None` on timeout.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<QueuedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.try_pop().await? {
                return Ok(Some(msg));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.wake.notified()).await;
        }
    }

    async fn try_pop(&self) -> Result<Option<QueuedMessage>> {
        self.db
            .call(|conn| {
                let tx = conn.transaction()?;
                let row = tx
                    .query_row(
                        "SELECT id, payload, enqueued_at FROM queue ORDER BY id ASC LIMIT 1",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((id, payload, enqueued_at)) = row else {
                    return Ok(None);
                };
                tx.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
                tx.commit()?;
                let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(QueuedMessage {
                    id,
                    payload,
                    enqueued_at,
                }))
            })
            .await
    }

    pub async fn len(&self) -> Result<u64> {
        self.db
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
                Ok(n as u64)
            })
            .await
    }

    /// Append a message that exhausted its retries to the dead-letter list.
    pub async fn dead_letter(&self, original_message: &str, error: &str, retries: u32) -> Result<()> {
        let original_message = original_message.to_string();
        let error = error.to_string();
        let error_for_db = error.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dead_letter (original_message, error, timestamp, retries)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![original_message, error_for_db, Utc::now().to_rfc3339(), retries],
                )?;
                Ok(())
            })
            .await?;
        tracing::error!(error = %error, retries, "message moved to dead-letter queue");
        Ok(())
    }

    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterEntry>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT original_message, error, timestamp, retries
                       FROM dead_letter ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (original_message, error, timestamp, retries) = row?;
                    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    out.push(DeadLetterEntry {
                        original_message,
                        error,
                        timestamp,
                        retries,
                    });
                }
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_database;

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let (db, _dir) = temp_database().await;
        let queue = WorkQueue::new(db);

        queue.push("first").await.expect("push first");
        queue.push("second").await.expect("push second");

        let a = queue
            .pop(Duration::from_secs(1))
            .await
            .expect("pop")
            .expect("message present");
        let b = queue
            .pop(Duration::from_secs(1))
            .await
            .expect("pop")
            .expect("message present");
        assert_eq!(a.payload, "first");
        assert_eq!(b.payload, "second");
        assert_eq!(queue.len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let (db, _dir) = temp_database().await;
        let queue = WorkQueue::new(db).with_poll_interval(Duration::from_millis(20));

        let popped = queue.pop(Duration::from_millis(80)).await.expect("pop");
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_concurrent_push() {
        let (db, _dir) = temp_database().await;
        let queue = WorkQueue::new(db).with_poll_interval(Duration::from_secs(5));

        let popper = queue.clone();
        let handle =
            tokio::spawn(async move { popper.pop(Duration::from_secs(5)).await.expect("pop") });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push("late arrival").await.expect("push");

        let msg = handle.await.expect("join").expect("message present");
        assert_eq!(msg.payload, "late arrival");
    }

    #[tokio::test]
    async fn dead_letter_entries_are_appended() {
        let (db, _dir) = temp_database().await;
        let queue = WorkQueue::new(db);

        queue
            .dead_letter(r#"{"channel":"chat"}"#, "failed after 3 retries", 3)
            .await
            .expect("dead letter");

        let entries = queue.dead_letters(10).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retries, 3);
        assert_eq!(entries[0].error, "failed after 3 retries");
        assert_eq!(entries[0].original_message, r#"{"channel":"chat"}"#);
    }
}
