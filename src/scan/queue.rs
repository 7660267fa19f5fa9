//! Durable chunk-job queue backed by Postgres.
//!
//! The queue delivers at-least-once; determinism comes from the job key,
//! `sha256(sessionId | phase | cursor-or-start)`. Enqueuing the same
//! (session, phase, cursor) twice collapses onto one row, so a retried
//! enqueue never doubles work. Claims use `FOR UPDATE SKIP LOCKED` so
//! multiple dispatchers can drain the queue concurrently.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// A claimed chunk job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanJob {
    pub id: i32,
    pub session_id: String,
    pub cursor: Option<String>,
}

/// Queue row exposed by diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: i32,
    pub session_id: String,
    pub status: JobStatus,
    pub cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Deterministic identity for one unit of work.
pub fn job_key(session_id: &str, phase: &str, cursor: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(phase.as_bytes());
    hasher.update(b"|");
    hasher.update(cursor.unwrap_or("start").as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ScanQueue {
    pool: PgPool,
}

impl ScanQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue the chunk job for (session, cursor). Returns the job id, or
    /// `None` when an identical job already exists.
    pub async fn enqueue_chunk(
        &self,
        session_id: &str,
        cursor: Option<&str>,
    ) -> Result<Option<i32>, sqlx::Error> {
        let key = job_key(session_id, "chunk", cursor);
        let id: Option<(i32,)> = sqlx::query_as(
            r#"INSERT INTO scan_jobs (job_key, session_id, cursor)
               VALUES ($1, $2, $3)
               ON CONFLICT (job_key) DO NOTHING
               RETURNING id"#,
        )
        .bind(&key)
        .bind(session_id)
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    /// Claim the next queued job atomically (SELECT FOR UPDATE SKIP LOCKED).
    pub async fn claim_next(&self) -> Result<Option<ScanJob>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let job: Option<(i32, String, Option<String>)> = sqlx::query_as(
            r#"SELECT id, session_id, cursor FROM scan_jobs
               WHERE status = 'queued'
               ORDER BY created_at ASC
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id, session_id, cursor)) = job {
            sqlx::query(
                "UPDATE scan_jobs SET status = 'running', started_at = COALESCE(started_at, NOW()) WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(Some(ScanJob {
                id,
                session_id,
                cursor,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn complete_job(&self, job_id: i32) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE scan_jobs SET status = 'succeeded', completed_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fail_job(&self, job_id: i32, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE scan_jobs SET status = 'failed', completed_at = NOW(), error_message = $1 WHERE id = $2",
        )
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent jobs for one session, newest first (diagnostics endpoint).
    pub async fn jobs_for_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<JobRecord>, sqlx::Error> {
        sqlx::query_as(
            r#"SELECT id, session_id, status, cursor, created_at, started_at, completed_at, error_message
               FROM scan_jobs
               WHERE session_id = $1
               ORDER BY id DESC
               LIMIT $2"#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_deterministic() {
        let a = job_key("s1", "chunk", None);
        let b = job_key("s1", "chunk", None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_job_key_varies_by_cursor_and_session() {
        let start = job_key("s1", "chunk", None);
        let page2 = job_key("s1", "chunk", Some("page2"));
        let other_session = job_key("s2", "chunk", None);
        assert_ne!(start, page2);
        assert_ne!(start, other_session);
    }
}
