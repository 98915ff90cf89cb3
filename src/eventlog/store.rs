//! `SQLite`-backed [`EventLog`]: durable append, tail reads, and pagination.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::{AppError, Result};

use super::model::{event_type_str, parse_event_type};
use super::schema;
use super::{Event, EventType, SessionMetadata, SessionStatus};

/// Append-only per-session event storage backed by a single `SQLite` connection pool.
///
/// Mirrors the host project's `Database` alias and connect/connect_memory
/// split: one writer connection (`max_connections(1)`) in WAL mode so append
/// and metadata update are always serialized with each other, matching the
/// single-writer-per-session contract this type exists to uphold.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    /// Connect to a file-backed `SQLite` database and bootstrap its schema.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&path.to_string_lossy())
            .map_err(|err| AppError::Db(format!("invalid db path: {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        schema::bootstrap_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect to an in-memory `SQLite` database. Used by tests to avoid
    /// filesystem coupling.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn connect_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|err| AppError::Db(format!("invalid memory uri: {err}")))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(opts)
            .await?;

        schema::bootstrap_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool, for collaborators (e.g. the message
    /// queue) that must share the single-writer connection rather than open
    /// their own.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Create a brand-new session row. Returns an error if `session_id` already exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including a duplicate key).
    pub async fn create_session(&self, metadata: &SessionMetadata) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let settings = serde_json::Value::Object(metadata.advanced_settings.clone()).to_string();

        sqlx::query(
            "INSERT INTO session (session_id, agent_command, working_directory, name, status,
             event_count, max_seq, acp_session_id, advanced_settings, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        )
        .bind(&metadata.session_id)
        .bind(&metadata.agent_command)
        .bind(&metadata.working_directory)
        .bind(&metadata.name)
        .bind(metadata.status.as_str())
        .bind(metadata.event_count)
        .bind(metadata.max_seq)
        .bind(&metadata.acp_session_id)
        .bind(settings)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist an event whose `seq` was pre-assigned by the Session.
    ///
    /// Durable before return. Updates `event_count` (+1) and
    /// `max_seq := max(max_seq, event.seq)` inside the same transaction as
    /// the insert, so a crash mid-append never leaves the metadata counters
    /// out of sync with the rows actually visible to readers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert or metadata update fails. On
    /// error, no partial state is visible: the whole operation is one
    /// transaction.
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO event (session_id, seq, event_type, timestamp, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&event.session_id)
        .bind(event.seq)
        .bind(event_type_str(event.event_type))
        .bind(event.timestamp.to_rfc3339())
        .bind(event.data.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE session SET
                event_count = event_count + 1,
                max_seq = MAX(max_seq, ?2),
                updated_at = ?3
             WHERE session_id = ?1",
        )
        .bind(&event.session_id)
        .bind(event.seq)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return all events for `session_id` with `seq > after_seq`, in seq order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn read_from(&self, session_id: &str, after_seq: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT session_id, seq, event_type, timestamp, data FROM event
             WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )
        .bind(session_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    /// Return up to `limit` events for `session_id` with the largest seqs
    /// strictly less than `before_seq` (or, if `before_seq == 0`, the newest
    /// `limit` events), in seq order.
    ///
    /// This is the pagination primitive for "load more history".
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn read_last(&self, session_id: &str, limit: u32, before_seq: i64) -> Result<Vec<Event>> {
        let rows = if before_seq > 0 {
            sqlx::query(
                "SELECT session_id, seq, event_type, timestamp, data FROM
                 (SELECT session_id, seq, event_type, timestamp, data FROM event
                  WHERE session_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3)
                 ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(before_seq)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT session_id, seq, event_type, timestamp, data FROM
                 (SELECT session_id, seq, event_type, timestamp, data FROM event
                  WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2)
                 ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(row_to_event).collect()
    }

    /// Fetch the metadata row for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session exists, or
    /// `AppError::Db` if the query fails.
    pub async fn get_metadata(&self, session_id: &str) -> Result<SessionMetadata> {
        let row = sqlx::query(
            "SELECT session_id, agent_command, working_directory, name, status,
                    event_count, max_seq, acp_session_id, advanced_settings
             FROM session WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("session '{session_id}' not found")))?;

        row_to_metadata(row)
    }

    /// List all sessions whose status is `active` (candidates for resume on startup).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active(&self) -> Result<Vec<SessionMetadata>> {
        let rows = sqlx::query(
            "SELECT session_id, agent_command, working_directory, name, status,
                    event_count, max_seq, acp_session_id, advanced_settings
             FROM session WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_metadata).collect()
    }

    /// Apply `mutator` to the current metadata and persist the result.
    ///
    /// Exclusive: serialized with appends by virtue of the single-writer
    /// connection pool, matching the spec's requirement that metadata
    /// mutation and append never interleave incoherently.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update_metadata(
        &self,
        session_id: &str,
        mutator: impl FnOnce(&mut SessionMetadata),
    ) -> Result<SessionMetadata> {
        let mut metadata = self.get_metadata(session_id).await?;
        mutator(&mut metadata);

        let settings = serde_json::Value::Object(metadata.advanced_settings.clone()).to_string();
        sqlx::query(
            "UPDATE session SET name = ?2, status = ?3, event_count = ?4, max_seq = ?5,
                acp_session_id = ?6, advanced_settings = ?7, updated_at = ?8
             WHERE session_id = ?1",
        )
        .bind(session_id)
        .bind(&metadata.name)
        .bind(metadata.status.as_str())
        .bind(metadata.event_count)
        .bind(metadata.max_seq)
        .bind(&metadata.acp_session_id)
        .bind(settings)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(metadata)
    }

    /// Record a restart attempt timestamp for the rolling-window budget check.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn record_restart(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO restart_history (session_id, restarted_at) VALUES (?1, ?2)")
            .bind(session_id)
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return restart timestamps for `session_id` recorded at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn restarts_since(&self, session_id: &str, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT restarted_at FROM restart_history WHERE session_id = ?1 AND restarted_at >= ?2",
        )
        .bind(session_id)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(ts,)| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|err| AppError::Db(format!("invalid restarted_at: {err}")))
            })
            .collect()
    }
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event> {
    let session_id: String = row.try_get("session_id")?;
    let seq: i64 = row.try_get("seq")?;
    let event_type_raw: String = row.try_get("event_type")?;
    let timestamp_raw: String = row.try_get("timestamp")?;
    let data_raw: String = row.try_get("data")?;

    let event_type = parse_event_type(&event_type_raw)
        .ok_or_else(|| AppError::Db(format!("invalid event_type: {event_type_raw}")))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(|err| AppError::Db(format!("invalid timestamp: {err}")))?
        .with_timezone(&Utc);
    let data: serde_json::Value = serde_json::from_str(&data_raw)?;

    Ok(Event {
        seq,
        session_id,
        event_type,
        timestamp,
        data,
    })
}

fn row_to_metadata(row: sqlx::sqlite::SqliteRow) -> Result<SessionMetadata> {
    let session_id: String = row.try_get("session_id")?;
    let agent_command: String = row.try_get("agent_command")?;
    let working_directory: String = row.try_get("working_directory")?;
    let name: String = row.try_get("name")?;
    let status_raw: String = row.try_get("status")?;
    let event_count: i64 = row.try_get("event_count")?;
    let max_seq: i64 = row.try_get("max_seq")?;
    let acp_session_id: Option<String> = row.try_get("acp_session_id")?;
    let settings_raw: String = row.try_get("advanced_settings")?;

    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| AppError::Db(format!("invalid session status: {status_raw}")))?;
    let advanced_settings = match serde_json::from_str(&settings_raw)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    Ok(SessionMetadata {
        session_id,
        agent_command,
        working_directory,
        name,
        status,
        event_count,
        max_seq,
        acp_session_id,
        advanced_settings,
    })
}

/// Re-exported for callers that need to reference the event type outside the
/// module path, matching how the host project surfaces row-level enums.
pub type EventKind = EventType;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn log_with_session() -> (EventLog, String) {
        let log = EventLog::connect_memory().await.expect("connect");
        let session_id = "s1".to_owned();
        log.create_session(&SessionMetadata::new(&session_id, "echo", "/tmp"))
            .await
            .expect("create");
        (log, session_id)
    }

    #[tokio::test]
    async fn append_updates_event_count_and_max_seq_atomically() {
        let (log, session_id) = log_with_session().await;
        log.append(&Event::new(&session_id, 1, EventType::UserPrompt, json!({"text": "hi"})))
            .await
            .expect("append");
        log.append(&Event::new(&session_id, 5, EventType::AgentMessage, json!({"html": "<p>hi</p>"})))
            .await
            .expect("append");

        let meta = log.get_metadata(&session_id).await.expect("metadata");
        assert_eq!(meta.event_count, 2);
        assert_eq!(meta.max_seq, 5, "max_seq must reflect sparse seq, not just event_count");
        assert!(meta.max_seq >= meta.event_count);
    }

    #[tokio::test]
    async fn read_from_returns_only_events_after_given_seq() {
        let (log, session_id) = log_with_session().await;
        for seq in 1..=5 {
            log.append(&Event::new(&session_id, seq, EventType::UserPrompt, json!({"n": seq})))
                .await
                .expect("append");
        }

        let events = log.read_from(&session_id, 3).await.expect("read_from");
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn read_last_pagination_returns_strictly_older_events_in_seq_order() {
        let (log, session_id) = log_with_session().await;
        for seq in 1..=10 {
            log.append(&Event::new(&session_id, seq, EventType::UserPrompt, json!({"n": seq})))
                .await
                .expect("append");
        }

        let page = log.read_last(&session_id, 3, 6).await.expect("read_last");
        let seqs: Vec<i64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn read_last_with_zero_before_seq_returns_newest_events() {
        let (log, session_id) = log_with_session().await;
        for seq in 1..=10 {
            log.append(&Event::new(&session_id, seq, EventType::UserPrompt, json!({"n": seq})))
                .await
                .expect("append");
        }

        let page = log.read_last(&session_id, 3, 0).await.expect("read_last");
        let seqs: Vec<i64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn read_last_all_then_read_from_zero_returns_same_set() {
        let (log, session_id) = log_with_session().await;
        for seq in 1..=7 {
            log.append(&Event::new(&session_id, seq, EventType::UserPrompt, json!({"n": seq})))
                .await
                .expect("append");
        }

        let via_last: Vec<i64> = log
            .read_last(&session_id, 1000, 0)
            .await
            .expect("read_last")
            .into_iter()
            .map(|e| e.seq)
            .collect();
        let via_from: Vec<i64> = log
            .read_from(&session_id, 0)
            .await
            .expect("read_from")
            .into_iter()
            .map(|e| e.seq)
            .collect();

        assert_eq!(via_last, via_from);
    }

    #[tokio::test]
    async fn next_seq_uses_max_of_event_count_and_max_seq() {
        let (log, session_id) = log_with_session().await;
        log.append(&Event::new(&session_id, 1, EventType::UserPrompt, json!({})))
            .await
            .expect("append");
        log.append(&Event::new(&session_id, 9, EventType::AgentMessage, json!({})))
            .await
            .expect("append");

        let meta = log.get_metadata(&session_id).await.expect("metadata");
        assert_eq!(meta.next_seq(), 10, "event_count + 1 would wrongly give 3");
    }
}
