//! One-shot IMAP endpoints: credential verification and a synchronous
//! single-chunk scan.
//!
//! Unlike Gmail sessions these run inline with the request: no session row,
//! no queue, no events. The response carries the chunk stats, candidates,
//! and the cursor a follow-up call can resume from.

use crate::auth::BearerUser;
use crate::error::ApiError;
use crate::mailbox::imap::{ImapConfig, ImapDriver, ImapVerify};
use crate::mailbox::DriverError;
use crate::models::{Candidate, ChunkStats, Provider};
use crate::scan::chunk::ChunkEngine;
use crate::scan::error::ScanErrorCode;
use crate::scan::options::ScanOptions;
use crate::store::directory;
use rocket::State;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx::PgPool;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

/// IMAP hosts that require app passwords for third-party clients.
const APP_PASSWORD_HOSTS: &[&str] = &[
    "imap.gmail.com",
    "imap.mail.yahoo.com",
    "imap.mail.me.com",
    "imap.aol.com",
];

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub provider: Provider,
    pub imap: Option<ImapConfig>,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<ImapVerify>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ScanErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanNowRequest {
    pub provider: Provider,
    pub imap: Option<ImapConfig>,
    #[serde(default)]
    pub options: Option<ScanOptions>,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanNowResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ChunkStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ScanErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Map a connection/auth failure to the closed error-code set.
fn classify_failure(config: &ImapConfig, err: &DriverError) -> ScanErrorCode {
    match err {
        DriverError::Auth(message) => {
            let host = config.host.to_lowercase();
            let needs_app_password = APP_PASSWORD_HOSTS.iter().any(|h| host == *h)
                || message.to_lowercase().contains("app password")
                || message.to_lowercase().contains("application-specific");
            if needs_app_password {
                ScanErrorCode::NeedsAppPassword
            } else {
                ScanErrorCode::AuthFailed
            }
        }
        DriverError::Network(_) | DriverError::Timeout { .. } => ScanErrorCode::NetworkError,
        _ => ScanErrorCode::Unknown,
    }
}

fn require_imap(provider: Provider, imap: Option<ImapConfig>) -> Result<ImapConfig, ApiError> {
    if provider != Provider::Imap {
        return Err(ApiError::BadRequest(
            "provider must be \"imap\" for this endpoint".to_string(),
        ));
    }
    let config = imap.ok_or_else(|| ApiError::BadRequest("imap settings are required".to_string()))?;
    if config.host.trim().is_empty() || config.username.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "imap.host and imap.username are required".to_string(),
        ));
    }
    Ok(config)
}

#[openapi(tag = "Email")]
#[post("/v1/email/verify", data = "<request>")]
pub async fn verify_mailbox(
    _user: BearerUser,
    request: Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let request = request.into_inner();
    let config = require_imap(request.provider, request.imap)?;

    match ImapDriver::verify(&config).await {
        Ok(info) => Ok(Json(VerifyResponse {
            ok: true,
            mailbox: Some(info),
            code: None,
            message: None,
        })),
        Err(err) => {
            log::info!("imap verify failed for {}: {err}", config.host);
            Ok(Json(VerifyResponse {
                ok: false,
                mailbox: None,
                code: Some(classify_failure(&config, &err)),
                message: Some(err.to_string()),
            }))
        }
    }
}

#[openapi(tag = "Email")]
#[post("/v1/email/scan", data = "<request>")]
pub async fn scan_mailbox(
    user: BearerUser,
    pool: &State<PgPool>,
    request: Json<ScanNowRequest>,
) -> Result<Json<ScanNowResponse>, ApiError> {
    let request = request.into_inner();
    let config = require_imap(request.provider, request.imap)?;
    let options = request.options.unwrap_or_default().enforce_budgets();
    let cursor = options.cursor.clone();

    let driver = match ImapDriver::connect(
        &config,
        options.days_back,
        options.page_size,
        options.mailbox_timeouts(),
    )
    .await
    {
        Ok(driver) => driver,
        Err(err) => {
            log::info!("imap connect failed for {}: {err}", config.host);
            return Ok(Json(ScanNowResponse {
                ok: false,
                stats: None,
                candidates: None,
                next_cursor: None,
                code: Some(classify_failure(&config, &err)),
                message: Some(err.to_string()),
            }));
        }
    };

    let directory_snapshot = directory::cached_directory(pool.inner()).await?;
    let overrides = directory::load_overrides(pool.inner(), &user.user_id).await?;

    let query = format!("INBOX since {}d", options.days_back);
    let engine = ChunkEngine::new(&driver, &options, &directory_snapshot, &overrides, query);
    match engine.run(cursor.as_deref(), chrono::Utc::now()).await {
        Ok(outcome) => Ok(Json(ScanNowResponse {
            ok: true,
            stats: Some(outcome.stats),
            candidates: Some(outcome.candidates),
            next_cursor: outcome.next_cursor,
            code: None,
            message: None,
        })),
        Err(err) => Ok(Json(ScanNowResponse {
            ok: false,
            stats: None,
            candidates: None,
            next_cursor: None,
            code: Some(classify_failure(&config, &err)),
            message: Some(err.to_string()),
        })),
    }
}
