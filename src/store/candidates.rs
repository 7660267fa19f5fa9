//! Candidate persistence.
//!
//! One row per (session, fingerprint); duplicate inserts are silently
//! dropped and never mutate the stored row, so the first write wins and
//! reruns of the same chunk are no-ops. The full candidate document lives in
//! a JSONB payload; a few columns are lifted out for queries.

use crate::models::Candidate;
use rocket_db_pools::sqlx::{self, PgPool};

pub struct CandidateStore {
    pool: PgPool,
}

impl CandidateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert candidates, skipping fingerprints the session already has.
    /// Returns the candidates that were actually new, in input order.
    pub async fn insert_new(
        &self,
        session_id: &str,
        user_id: &str,
        candidates: &[Candidate],
    ) -> Result<Vec<Candidate>, sqlx::Error> {
        let mut inserted = Vec::new();
        for candidate in candidates {
            let payload =
                serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null);
            let row: Option<(String,)> = sqlx::query_as(
                r#"INSERT INTO scan_candidates
                       (session_id, user_id, fingerprint, merchant, amount, currency, confidence, payload)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                   ON CONFLICT (session_id, fingerprint) DO NOTHING
                   RETURNING fingerprint"#,
            )
            .bind(session_id)
            .bind(user_id)
            .bind(&candidate.fingerprint)
            .bind(&candidate.merchant)
            .bind(candidate.amount)
            .bind(&candidate.currency)
            .bind(candidate.confidence)
            .bind(payload)
            .fetch_optional(&self.pool)
            .await?;

            if row.is_some() {
                inserted.push(candidate.clone());
            }
        }
        Ok(inserted)
    }

    /// All stored candidates for a session, highest confidence first.
    pub async fn list_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Candidate>, sqlx::Error> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"SELECT payload FROM scan_candidates
               WHERE session_id = $1
               ORDER BY confidence DESC, created_at ASC"#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(payload,)| serde_json::from_value(payload).ok())
            .collect())
    }
}
