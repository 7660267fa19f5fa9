//! Session persistence and lease discipline.
//!
//! A session is mutated only by its current lease holder. Leases run 30
//! seconds and are renewed between chunk stages; an expired lease may be
//! stolen by another worker. Terminal states are sticky: every transition
//! UPDATE guards on the current status, so a `done`/`canceled`/`error`
//! session can never move again.

use crate::models::{Provider, Session, SessionStatus};
use crate::scan::error::ScanErrorCode;
use chrono::{Duration, Utc};
use rocket_db_pools::sqlx::{self, PgPool};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lease length; renewed between chunk stages.
const LEASE_SECONDS: i64 = 30;

const SESSION_COLUMNS: &str = "id, user_id, provider, status, cursor, options, pages, \
     scanned_total, found_total, last_stats, error_code, error_message, \
     leased_by, lease_expires_at, created_at";

pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a session in `queued`.
    pub async fn create(
        &self,
        user_id: &str,
        provider: Provider,
        options: JsonValue,
    ) -> Result<Session, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        sqlx::query_as(&format!(
            r#"INSERT INTO scan_sessions (id, user_id, provider, options)
               VALUES ($1, $2, $3, $4)
               RETURNING {SESSION_COLUMNS}"#
        ))
        .bind(&id)
        .bind(user_id)
        .bind(provider)
        .bind(options)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM scan_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fetch a session only when it belongs to `user_id`.
    pub async fn get_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM scan_sessions WHERE id = $1 AND user_id = $2"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// External cancel: allowed from `queued` or `running` only.
    pub async fn cancel(&self, session_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"UPDATE scan_sessions
               SET status = 'canceled'
               WHERE id = $1 AND user_id = $2 AND status IN ('queued', 'running')"#,
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Take (or steal) the lease for a session. Succeeds when the session is
    /// non-terminal and unleased, already ours, or the lease has expired.
    pub async fn acquire_lease(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        let expires = Utc::now() + Duration::seconds(LEASE_SECONDS);
        sqlx::query_as(&format!(
            r#"UPDATE scan_sessions
               SET leased_by = $2, lease_expires_at = $3
               WHERE id = $1
                 AND status IN ('queued', 'running')
                 AND (leased_by IS NULL OR leased_by = $2 OR lease_expires_at < NOW())
               RETURNING {SESSION_COLUMNS}"#
        ))
        .bind(session_id)
        .bind(worker_id)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await
    }

    /// Extend our lease; a false return means the lease was lost.
    pub async fn renew_lease(
        &self,
        session_id: &str,
        worker_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let expires = Utc::now() + Duration::seconds(LEASE_SECONDS);
        let result = sqlx::query(
            "UPDATE scan_sessions SET lease_expires_at = $3 WHERE id = $1 AND leased_by = $2",
        )
        .bind(session_id)
        .bind(worker_id)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// First lease: `queued` -> `running`.
    pub async fn mark_running(&self, session_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE scan_sessions SET status = 'running' WHERE id = $1 AND status = 'queued'")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance counters after a chunk. Counters only ever grow; the adds are
    /// in SQL so concurrent observers never see a decrease.
    pub async fn update_progress(
        &self,
        session_id: &str,
        scanned_delta: i64,
        found_delta: i64,
        cursor: Option<&str>,
        last_stats: JsonValue,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE scan_sessions
               SET pages = pages + 1,
                   scanned_total = scanned_total + $2,
                   found_total = found_total + $3,
                   cursor = $4,
                   last_stats = $5
               WHERE id = $1"#,
        )
        .bind(session_id)
        .bind(scanned_delta.max(0))
        .bind(found_delta.max(0))
        .bind(cursor)
        .bind(last_stats)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_done(&self, session_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE scan_sessions SET status = 'done', leased_by = NULL WHERE id = $1 AND status = 'running'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_error(
        &self,
        session_id: &str,
        code: ScanErrorCode,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE scan_sessions
               SET status = 'error', error_code = $2, error_message = $3, leased_by = NULL
               WHERE id = $1 AND status IN ('queued', 'running')"#,
        )
        .bind(session_id)
        .bind(code.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current status, for the between-chunk cancel check.
    pub async fn status(&self, session_id: &str) -> Result<Option<SessionStatus>, sqlx::Error> {
        let row: Option<(SessionStatus,)> =
            sqlx::query_as("SELECT status FROM scan_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(status,)| status))
    }
}
