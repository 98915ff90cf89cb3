//! Idempotent `SQLite` schema bootstrap for the event log and its satellite tables.

use sqlx::SqlitePool;

use crate::Result;

/// Create all tables and indexes if they do not already exist.
///
/// Safe to call on every process start: every statement is
/// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`, so repeated
/// bootstrap against an already-migrated database is a no-op.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        r"
        CREATE TABLE IF NOT EXISTS session (
            session_id          TEXT PRIMARY KEY,
            agent_command       TEXT NOT NULL,
            working_directory   TEXT NOT NULL,
            name                TEXT NOT NULL DEFAULT '',
            status              TEXT NOT NULL CHECK (status IN ('active', 'suspended', 'completed')),
            event_count         INTEGER NOT NULL DEFAULT 0,
            max_seq             INTEGER NOT NULL DEFAULT 0,
            acp_session_id      TEXT,
            advanced_settings   TEXT NOT NULL DEFAULT '{}',
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event (
            session_id   TEXT NOT NULL,
            seq          INTEGER NOT NULL,
            event_type   TEXT NOT NULL CHECK (event_type IN (
                'agent_message', 'agent_thought', 'tool_call', 'tool_update',
                'plan', 'file_read', 'file_write', 'user_prompt', 'permission', 'session_end'
            )),
            timestamp    TEXT NOT NULL,
            data         TEXT NOT NULL,
            PRIMARY KEY (session_id, seq),
            FOREIGN KEY (session_id) REFERENCES session(session_id)
        );

        CREATE INDEX IF NOT EXISTS idx_event_session_seq ON event (session_id, seq);

        CREATE TABLE IF NOT EXISTS queued_message (
            id            TEXT PRIMARY KEY,
            session_id    TEXT NOT NULL,
            message_text  TEXT NOT NULL,
            image_ids     TEXT NOT NULL DEFAULT '[]',
            file_ids      TEXT NOT NULL DEFAULT '[]',
            sender_id     TEXT NOT NULL,
            enqueued_at   TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES session(session_id)
        );

        CREATE INDEX IF NOT EXISTS idx_queued_message_session ON queued_message (session_id, enqueued_at);

        CREATE TABLE IF NOT EXISTS restart_history (
            session_id    TEXT NOT NULL,
            restarted_at  TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES session(session_id)
        );

        CREATE INDEX IF NOT EXISTS idx_restart_history_session ON restart_history (session_id, restarted_at);
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
