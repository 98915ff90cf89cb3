//! Durable FIFO queue of messages awaiting dispatch once a Session's current
//! prompt attempt finishes.
//!
//! Row mapping follows the same pattern as the event log's own repository
//! methods: a thin `SqliteRow` reader, explicit RFC3339 timestamp parsing,
//! `AppError::Db` on malformed rows.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{AppError, Result};

use super::types::QueuedMessage;

/// `SQLite`-backed FIFO for one session's pending prompts.
///
/// Shares the event log's connection pool rather than opening a second
/// connection, so enqueue/dequeue never race the single-writer append path.
#[derive(Clone)]
pub struct MessageQueue {
    pool: SqlitePool,
    session_id: String,
}

impl MessageQueue {
    /// Bind a queue view to `session_id` over the given pool.
    #[must_use]
    pub fn new(pool: SqlitePool, session_id: impl Into<String>) -> Self {
        Self { pool, session_id: session_id.into() }
    }

    /// Append a message to the back of the queue. Returns the generated id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn enqueue(
        &self,
        message_text: &str,
        image_ids: &[String],
        file_ids: &[String],
        sender_id: &str,
    ) -> Result<QueuedMessage> {
        let message = QueuedMessage {
            id: Uuid::new_v4().to_string(),
            message_text: message_text.to_owned(),
            image_ids: image_ids.to_vec(),
            file_ids: file_ids.to_vec(),
            sender_id: sender_id.to_owned(),
            enqueued_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO queued_message (id, session_id, message_text, image_ids, file_ids, sender_id, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&message.id)
        .bind(&self.session_id)
        .bind(&message.message_text)
        .bind(serde_json::to_string(&message.image_ids)?)
        .bind(serde_json::to_string(&message.file_ids)?)
        .bind(&message.sender_id)
        .bind(message.enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Pop the oldest queued message, if any, removing it from the queue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or delete fails.
    pub async fn pop_oldest(&self) -> Result<Option<QueuedMessage>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, message_text, image_ids, file_ids, sender_id, enqueued_at
             FROM queued_message WHERE session_id = ?1 ORDER BY enqueued_at ASC LIMIT 1",
        )
        .bind(&self.session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let message = row_to_message(row)?;

        sqlx::query("DELETE FROM queued_message WHERE id = ?1")
            .bind(&message.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(message))
    }

    /// Number of messages currently queued.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn len(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queued_message WHERE session_id = ?1")
            .bind(&self.session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Whether the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove every queued message for this session, e.g. on `force_reset`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM queued_message WHERE session_id = ?1")
            .bind(&self.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<QueuedMessage> {
    let id: String = row.try_get("id")?;
    let message_text: String = row.try_get("message_text")?;
    let image_ids_raw: String = row.try_get("image_ids")?;
    let file_ids_raw: String = row.try_get("file_ids")?;
    let sender_id: String = row.try_get("sender_id")?;
    let enqueued_at_raw: String = row.try_get("enqueued_at")?;

    let image_ids: Vec<String> = serde_json::from_str(&image_ids_raw)?;
    let file_ids: Vec<String> = serde_json::from_str(&file_ids_raw)?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at_raw)
        .map_err(|err| AppError::Db(format!("invalid enqueued_at: {err}")))?
        .with_timezone(&Utc);

    Ok(QueuedMessage { id, message_text, image_ids, file_ids, sender_id, enqueued_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn memory_pool() -> SqlitePool {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").expect("opts");
        let pool = SqlitePoolOptions::new().max_connections(1).min_connections(1).connect_with(opts).await.expect("pool");
        crate::eventlog::bootstrap_schema_for_tests(&pool).await.expect("bootstrap schema");
        sqlx::query(
            "INSERT INTO session (session_id, agent_command, working_directory, status, created_at, updated_at)
             VALUES ('s1', 'echo', '/tmp', 'active', '1970-01-01T00:00:00Z', '1970-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("seed session");
        pool
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let pool = memory_pool().await;
        let queue = MessageQueue::new(pool, "s1");

        queue.enqueue("first", &[], &[], "user-a").await.expect("enqueue");
        queue.enqueue("second", &[], &[], "user-a").await.expect("enqueue");

        let first = queue.pop_oldest().await.expect("pop").expect("some");
        assert_eq!(first.message_text, "first");
        let second = queue.pop_oldest().await.expect("pop").expect("some");
        assert_eq!(second.message_text, "second");
        assert!(queue.pop_oldest().await.expect("pop").is_none());
    }

    #[tokio::test]
    async fn len_and_is_empty_track_queue_state() {
        let pool = memory_pool().await;
        let queue = MessageQueue::new(pool, "s1");

        assert!(queue.is_empty().await.expect("is_empty"));
        queue.enqueue("hi", &[], &[], "user-a").await.expect("enqueue");
        assert_eq!(queue.len().await.expect("len"), 1);

        queue.clear().await.expect("clear");
        assert!(queue.is_empty().await.expect("is_empty"));
    }
}
