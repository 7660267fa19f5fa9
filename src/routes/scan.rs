//! Gmail scan session endpoints: start, run, cancel, status, SSE stream,
//! and diagnostics.
//!
//! Starting a scan creates a `queued` session, stores the caller's Google
//! tokens, writes the `hello` event idempotently, and enqueues the first
//! chunk. Everything else is observation: the dispatcher owns the session
//! from there.

use crate::auth::BearerUser;
use crate::error::ApiError;
use crate::mailbox::token::{AuthPayload, StoredTokenProvider};
use crate::models::{EventRecord, EventType, Provider, Session, SessionStatus};
use crate::scan::error::ScanErrorCode;
use crate::scan::options::ScanOptions;
use crate::scan::queue::{JobRecord, ScanQueue};
use crate::store::{CandidateStore, EventLog, SessionStore};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::tokio::select;
use rocket::tokio::time::interval;
use rocket::{Shutdown, State};
use rocket_db_pools::sqlx::PgPool;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// How often the SSE loop polls the event log.
const STREAM_POLL: Duration = Duration::from_millis(800);

/// Keep-alive ping cadence.
const STREAM_PING: Duration = Duration::from_secs(2);

/// Events fetched per poll.
const STREAM_BATCH: i64 = 100;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartScanRequest {
    pub auth: AuthPayload,
    #[serde(default)]
    pub options: Option<ScanOptions>,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartScanResponse {
    pub ok: bool,
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct OkResponse {
    pub ok: bool,
}

/// Query parameters identifying a session on GET endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, rocket::form::FromForm)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    #[field(name = "sessionId")]
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Resume the stream after this event id.
    #[field(name = "afterId")]
    #[serde(default, rename = "afterId")]
    pub after_id: Option<i64>,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsResponse {
    pub session: Session,
    /// Most recent queue jobs for the session, newest first.
    pub jobs: Vec<JobRecord>,
    /// Most recent events, newest first.
    pub events: Vec<EventRecord>,
    /// Stored candidate count.
    pub candidates: usize,
}

#[openapi(tag = "Gmail Scan")]
#[post("/v1/gmail/scan/start", data = "<request>")]
pub async fn start_scan(
    user: BearerUser,
    pool: &State<PgPool>,
    request: Json<StartScanRequest>,
) -> Result<Json<StartScanResponse>, ApiError> {
    let request = request.into_inner();
    if request.auth.access_token.trim().is_empty() && request.auth.refresh_token.is_none() {
        return Err(ApiError::BadRequest(
            "auth.accessToken or auth.refreshToken is required".to_string(),
        ));
    }

    let options = request.options.unwrap_or_default().enforce_budgets();
    let options_json = serde_json::to_value(&options)
        .map_err(|e| ApiError::Internal(format!("options serialize failed: {e}")))?;

    let tokens = StoredTokenProvider::new(pool.inner().clone());
    tokens
        .save(&user.user_id, Provider::Gmail, &request.auth)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to store tokens: {e}")))?;

    let sessions = SessionStore::new(pool.inner().clone());
    let session = sessions
        .create(&user.user_id, Provider::Gmail, options_json)
        .await
        .map_err(|e| {
            ApiError::Internal(format!(
                "{}: {e}",
                ScanErrorCode::SessionCreateFailed.as_str()
            ))
        })?;

    let events = EventLog::new(pool.inner().clone());
    let hello_key = format!("hello:{}", session.id);
    if let Err(err) = events
        .append(
            &session.id,
            &user.user_id,
            EventType::Hello,
            json!({ "sessionId": session.id, "provider": "gmail" }),
            Some(&hello_key),
        )
        .await
    {
        log::warn!("session {}: hello event failed: {err}", session.id);
    }

    let queue = ScanQueue::new(pool.inner().clone());
    queue
        .enqueue_chunk(&session.id, None)
        .await
        .map_err(|_| ApiError::QueueUnavailable(ScanErrorCode::QueueEnqueueFailed))?;

    log::info!("session {}: scan started for user {}", session.id, user.user_id);
    Ok(Json(StartScanResponse {
        ok: true,
        session_id: session.id,
        status: SessionStatus::Queued,
    }))
}

#[openapi(tag = "Gmail Scan")]
#[post("/v1/gmail/scan/run", data = "<request>")]
pub async fn run_scan(
    user: BearerUser,
    pool: &State<PgPool>,
    request: Json<SessionRef>,
) -> Result<Json<OkResponse>, ApiError> {
    let sessions = SessionStore::new(pool.inner().clone());
    let session = sessions
        .get_for_user(&request.session_id, &user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if session.status.is_terminal() {
        return Err(ApiError::BadRequest(format!(
            "session is {:?}",
            session.status
        )));
    }

    let queue = ScanQueue::new(pool.inner().clone());
    queue
        .enqueue_chunk(&session.id, session.cursor.as_deref())
        .await
        .map_err(|_| ApiError::QueueUnavailable(ScanErrorCode::QueueEnqueueFailed))?;

    Ok(Json(OkResponse { ok: true }))
}

#[openapi(tag = "Gmail Scan")]
#[post("/v1/gmail/scan/cancel", data = "<request>")]
pub async fn cancel_scan(
    user: BearerUser,
    pool: &State<PgPool>,
    request: Json<SessionRef>,
) -> Result<Json<OkResponse>, ApiError> {
    let sessions = SessionStore::new(pool.inner().clone());
    let canceled = sessions.cancel(&request.session_id, &user.user_id).await?;
    if !canceled {
        // Either unknown or already terminal; distinguish for the caller.
        let exists = sessions
            .get_for_user(&request.session_id, &user.user_id)
            .await?
            .is_some();
        if !exists {
            return Err(ApiError::NotFound);
        }
    }
    Ok(Json(OkResponse { ok: true }))
}

#[openapi(tag = "Gmail Scan")]
#[get("/v1/gmail/scan/status?<params..>")]
pub async fn scan_status(
    user: BearerUser,
    pool: &State<PgPool>,
    params: SessionQuery,
) -> Result<Json<Session>, ApiError> {
    let sessions = SessionStore::new(pool.inner().clone());
    let session = sessions
        .get_for_user(&params.session_id, &user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(session))
}

#[openapi(tag = "Gmail Scan")]
#[get("/v1/gmail/scan/diagnostics/<session_id>")]
pub async fn scan_diagnostics(
    user: BearerUser,
    pool: &State<PgPool>,
    session_id: String,
) -> Result<Json<DiagnosticsResponse>, ApiError> {
    let sessions = SessionStore::new(pool.inner().clone());
    let session = sessions
        .get_for_user(&session_id, &user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let queue = ScanQueue::new(pool.inner().clone());
    let jobs = queue.jobs_for_session(&session_id, 10).await?;

    let events = EventLog::new(pool.inner().clone());
    let events = events.recent(&session_id, 50).await?;

    let candidates = CandidateStore::new(pool.inner().clone());
    let candidates = candidates.list_for_session(&session_id).await?.len();

    Ok(Json(DiagnosticsResponse {
        session,
        jobs,
        events,
        candidates,
    }))
}

/// SSE projection of the event log. Forwards rows in id order starting
/// after `after_id`, pings to keep intermediaries alive, and ends after a
/// terminal `done`/`error` event. Dropping the connection stops the poll
/// loop with it.
#[openapi(skip)]
#[get("/v1/gmail/scan/stream?<params..>")]
pub async fn stream_scan(
    user: BearerUser,
    pool: &State<PgPool>,
    params: SessionQuery,
    mut shutdown: Shutdown,
) -> Result<EventStream![Event + 'static], ApiError> {
    let session_id = params.session_id.clone();
    let sessions = SessionStore::new(pool.inner().clone());
    sessions
        .get_for_user(&session_id, &user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let log = EventLog::new(pool.inner().clone());

    Ok(EventStream! {
        let mut cursor = params.after_id.unwrap_or(0);
        let mut poll = interval(STREAM_POLL);
        let mut ping = interval(STREAM_PING);

        loop {
            let batch: Option<Vec<EventRecord>> = select! {
                _ = &mut shutdown => break,
                _ = ping.tick() => None,
                _ = poll.tick() => {
                    match log.poll_after(&session_id, cursor, STREAM_BATCH).await {
                        Ok(events) => Some(events),
                        Err(err) => {
                            log::warn!("session {session_id}: event poll failed: {err}");
                            Some(Vec::new())
                        }
                    }
                }
            };

            match batch {
                None => yield Event::json(&json!({ "ok": true })).event("ping"),
                Some(events) => {
                    let mut terminal = false;
                    for record in events {
                        cursor = record.id;
                        terminal |= matches!(
                            record.event_type,
                            EventType::Done | EventType::Error
                        );
                        yield Event::json(&record.payload)
                            .event(record.event_type.as_str())
                            .id(record.id.to_string());
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }
    })
}
