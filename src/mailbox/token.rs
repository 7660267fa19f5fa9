//! Access-token resolution for provider APIs.
//!
//! Tokens arrive with the scan-start request, are stored per
//! (user, provider), and are resolved again before every chunk. When the
//! stored access token is stale and a refresh token plus client credentials
//! are available, the provider exchanges it against Google's token endpoint;
//! at most one refresh write happens per session run.

use crate::models::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens supplied by the caller when starting a scan.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token expiry, epoch milliseconds.
    pub expires_at: Option<i64>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no usable token for user")]
    Missing,
    #[error("token refresh failed: {0}")]
    BootstrapFailed(String),
    #[error("token store error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Pluggable token source consulted by the dispatcher before each chunk.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, user_id: &str, provider: Provider) -> Result<String, TokenError>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Postgres-backed token provider with the Google refresh flow.
pub struct StoredTokenProvider {
    pool: PgPool,
    http: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl StoredTokenProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
            client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
        }
    }

    /// Upsert the tokens supplied with a scan-start request.
    pub async fn save(
        &self,
        user_id: &str,
        provider: Provider,
        auth: &AuthPayload,
    ) -> Result<(), TokenError> {
        let expires_at = auth
            .expires_at
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        sqlx::query(
            r#"INSERT INTO oauth_tokens (user_id, provider, access_token, refresh_token, expires_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, NOW())
               ON CONFLICT (user_id, provider)
               DO UPDATE SET
                   access_token = EXCLUDED.access_token,
                   refresh_token = COALESCE(EXCLUDED.refresh_token, oauth_tokens.refresh_token),
                   expires_at = EXCLUDED.expires_at,
                   updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(&auth.access_token)
        .bind(&auth.refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh(&self, user_id: &str, refresh_token: &str) -> Result<String, TokenError> {
        let (Some(client_id), Some(client_secret)) =
            (self.client_id.as_deref(), self.client_secret.as_deref())
        else {
            return Err(TokenError::BootstrapFailed(
                "google client credentials not configured".to_string(),
            ));
        };

        let response = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| TokenError::BootstrapFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::BootstrapFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| TokenError::BootstrapFailed(e.to_string()))?;

        let expires_at = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        sqlx::query(
            r#"UPDATE oauth_tokens
               SET access_token = $1, expires_at = $2, updated_at = NOW()
               WHERE user_id = $3 AND provider = 'gmail'"#,
        )
        .bind(&refreshed.access_token)
        .bind(expires_at)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        log::info!("refreshed gmail access token for user {user_id}");
        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl TokenProvider for StoredTokenProvider {
    async fn access_token(&self, user_id: &str, provider: Provider) -> Result<String, TokenError> {
        let row: Option<(String, Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"SELECT access_token, refresh_token, expires_at
               FROM oauth_tokens
               WHERE user_id = $1 AND provider = $2"#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        let Some((access_token, refresh_token, expires_at)) = row else {
            return Err(TokenError::Missing);
        };

        let still_valid = expires_at
            .map(|at| at > Utc::now() + Duration::seconds(60))
            .unwrap_or(true);
        if still_valid && !access_token.is_empty() {
            return Ok(access_token);
        }

        if let Some(refresh_token) = refresh_token.as_deref() {
            match self.refresh(user_id, refresh_token).await {
                Ok(token) => return Ok(token),
                Err(err) => {
                    // A stale access token is still worth an attempt; the
                    // driver maps a 401 to AUTH_FAILED.
                    log::warn!("user {user_id}: token refresh failed: {err}");
                }
            }
        }

        if access_token.is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(access_token)
    }
}
