//! Append-only per-session event log.
//!
//! Ids come from one BIGSERIAL, so they strictly increase within a session
//! and readers can poll `id > cursor`. Writes carrying a dedupe key are
//! idempotent: a partial unique index on (session_id, dedupe_key) collapses
//! concurrent duplicates to a single row.

use crate::models::{EventRecord, EventType};
use rocket_db_pools::sqlx::{self, PgPool};
use serde_json::Value as JsonValue;

const EVENT_COLUMNS: &str =
    "id, session_id, user_id, event_type, payload, dedupe_key, created_at";

pub struct EventLog {
    pool: PgPool,
}

impl EventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event. Returns the new event id, or `None` when an event
    /// with the same (session, dedupeKey) already exists.
    pub async fn append(
        &self,
        session_id: &str,
        user_id: &str,
        event_type: EventType,
        payload: JsonValue,
        dedupe_key: Option<&str>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let id: Option<(i64,)> = sqlx::query_as(
            r#"INSERT INTO scan_events (session_id, user_id, event_type, payload, dedupe_key)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (session_id, dedupe_key) WHERE dedupe_key IS NOT NULL
               DO NOTHING
               RETURNING id"#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(event_type)
        .bind(payload)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(|(id,)| id))
    }

    /// Events with `id > after_id`, oldest first. The SSE poll loop.
    pub async fn poll_after(
        &self,
        session_id: &str,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>, sqlx::Error> {
        sqlx::query_as(&format!(
            r#"SELECT {EVENT_COLUMNS}
               FROM scan_events
               WHERE session_id = $1 AND id > $2
               ORDER BY id ASC
               LIMIT $3"#
        ))
        .bind(session_id)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Most recent events, newest first (diagnostics endpoint).
    pub async fn recent(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>, sqlx::Error> {
        sqlx::query_as(&format!(
            r#"SELECT {EVENT_COLUMNS}
               FROM scan_events
               WHERE session_id = $1
               ORDER BY id DESC
               LIMIT $2"#
        ))
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
