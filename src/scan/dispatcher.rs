//! Scan job dispatcher and session orchestration.
//!
//! A long-running worker that claims chunk jobs from the queue and walks
//! each session through its state machine:
//!
//! 1. Load the session; terminal statuses short-circuit, an observed cancel
//!    emits the final `done {canceled:true}` event.
//! 2. Acquire (or steal) the session lease; first lease flips `queued` to
//!    `running` and emits the starting `progress` event.
//! 3. Clamp the stored options through the SLO budgets, resolve a fresh
//!    access token, and run one chunk.
//! 4. Persist new candidates, advance the session counters, and emit the
//!    chunk's `progress` / `candidates` events with deterministic dedupe
//!    keys, so an at-least-once queue still yields exactly-once visible
//!    events.
//! 5. Terminate (`done`) when the cursor is exhausted or a budget cap is
//!    reached; otherwise pace briefly, re-check for cancellation, and
//!    enqueue the next chunk.
//!
//! Per-message failures never reach this layer; chunk-fatal failures mark
//! the session `error` with a code from the closed set and emit an `error`
//! event idempotently.

use crate::mailbox::DriverError;
use crate::mailbox::gmail::{GmailDriver, build_query};
use crate::mailbox::token::{StoredTokenProvider, TokenError, TokenProvider};
use crate::models::{EventType, Provider, Session, SessionStatus};
use crate::scan::chunk::{ChunkEngine, ChunkOutcome};
use crate::scan::error::ScanErrorCode;
use crate::scan::options::ScanOptions;
use crate::scan::queue::{ScanJob, ScanQueue};
use crate::store::{CandidateStore, EventLog, SessionStore, directory};
use rocket_db_pools::sqlx::PgPool;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Pause between finishing a chunk and enqueuing the next one.
const INTER_CHUNK_PAUSE: Duration = Duration::from_millis(120);

/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// How often a running chunk renews its session lease.
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(10);

pub struct ScanDispatcher {
    pool: PgPool,
    queue: ScanQueue,
    sessions: SessionStore,
    events: EventLog,
    candidates: CandidateStore,
    tokens: StoredTokenProvider,
    worker_id: String,
}

impl ScanDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            queue: ScanQueue::new(pool.clone()),
            sessions: SessionStore::new(pool.clone()),
            events: EventLog::new(pool.clone()),
            candidates: CandidateStore::new(pool.clone()),
            tokens: StoredTokenProvider::new(pool.clone()),
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            pool,
        }
    }

    /// Run the dispatcher loop forever.
    pub async fn run(self) -> ! {
        log::info!("scan dispatcher {} started", self.worker_id);

        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_POLL).await,
                Err(err) => {
                    log::error!("dispatcher: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether a job was
    /// claimed. Split out of the loop so tests can step the dispatcher one
    /// job at a time.
    pub async fn process_next(&self) -> Result<bool, String> {
        let job = self
            .queue
            .claim_next()
            .await
            .map_err(|e| format!("failed to claim job: {e}"))?;
        let Some(job) = job else {
            return Ok(false);
        };

        let job_id = job.id;
        if let Err(err) = self.process_job(job).await {
            log::error!("job {job_id}: processing failed: {err}");
            let _ = self.queue.fail_job(job_id, &err).await;
        }
        Ok(true)
    }

    /// Append an event, swallowing storage failures; events are best-effort
    /// from the worker's point of view, idempotent from the client's.
    async fn emit(
        &self,
        session: &Session,
        event_type: EventType,
        payload: serde_json::Value,
        dedupe_key: &str,
    ) {
        if let Err(err) = self
            .events
            .append(
                &session.id,
                &session.user_id,
                event_type,
                payload,
                Some(dedupe_key),
            )
            .await
        {
            log::warn!(
                "session {}: failed to append {} event: {err}",
                session.id,
                event_type.as_str()
            );
        }
    }

    /// Terminal failure: session -> `error`, `error` event, job done.
    async fn fail_session(
        &self,
        job_id: i32,
        session: &Session,
        code: ScanErrorCode,
        message: &str,
    ) -> Result<(), String> {
        log::warn!("session {}: failing with {code}: {message}", session.id);
        self.sessions
            .mark_error(&session.id, code, message)
            .await
            .map_err(|e| format!("failed to mark session error: {e}"))?;
        self.emit(
            session,
            EventType::Error,
            json!({ "code": code.as_str(), "message": message }),
            "error",
        )
        .await;
        self.queue
            .complete_job(job_id)
            .await
            .map_err(|e| format!("failed to complete job: {e}"))?;
        Ok(())
    }

    async fn emit_canceled_done(&self, session: &Session) {
        self.emit(
            session,
            EventType::Done,
            json!({
                "canceled": true,
                "pages": session.pages,
                "scannedTotal": session.scanned_total,
                "foundTotal": session.found_total,
            }),
            "done",
        )
        .await;
    }

    async fn process_job(&self, job: ScanJob) -> Result<(), String> {
        let job_id = job.id;

        let session = self
            .sessions
            .get(&job.session_id)
            .await
            .map_err(|e| format!("failed to load session: {e}"))?;
        let Some(session) = session else {
            self.queue
                .complete_job(job_id)
                .await
                .map_err(|e| e.to_string())?;
            return Err(format!("session {} not found", job.session_id));
        };

        // Terminal statuses are sticky; an observed cancel still owes the
        // client its final event.
        if session.status == SessionStatus::Canceled {
            self.emit_canceled_done(&session).await;
            self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        }
        if session.status.is_terminal() {
            self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        }

        // Lease: if another live worker owns the session, let them have it.
        let leased = self
            .sessions
            .acquire_lease(&session.id, &self.worker_id)
            .await
            .map_err(|e| format!("failed to acquire lease: {e}"))?;
        let Some(session) = leased else {
            log::debug!("session {}: lease held elsewhere, skipping", session.id);
            self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        };

        if session.status == SessionStatus::Queued {
            self.sessions
                .mark_running(&session.id)
                .await
                .map_err(|e| format!("failed to mark running: {e}"))?;
            self.emit(
                &session,
                EventType::Progress,
                json!({ "phase": "starting", "pages": 0 }),
                "progress:starting",
            )
            .await;
        }

        let options: ScanOptions = serde_json::from_value(session.options.clone())
            .unwrap_or_default();
        let options = options.enforce_budgets();

        match session.provider {
            Provider::Gmail => {
                self.run_gmail_chunk(job_id, &session, &options, job.cursor.as_deref())
                    .await
            }
            Provider::Imap => {
                // IMAP runs synchronously via the one-shot scan endpoint;
                // queued sessions only exist for token-backed providers.
                self.fail_session(
                    job_id,
                    &session,
                    ScanErrorCode::UnsupportedProvider,
                    "imap sessions are not queue-driven",
                )
                .await
            }
        }
    }

    async fn run_gmail_chunk(
        &self,
        job_id: i32,
        session: &Session,
        options: &ScanOptions,
        job_cursor: Option<&str>,
    ) -> Result<(), String> {
        // The session cursor is authoritative; the job cursor only names the
        // work so retries dedupe.
        let cursor = session.cursor.as_deref().or(job_cursor);

        let token = match self
            .tokens
            .access_token(&session.user_id, Provider::Gmail)
            .await
        {
            Ok(token) => token,
            Err(TokenError::Missing) => {
                return self
                    .fail_session(
                        job_id,
                        session,
                        ScanErrorCode::MissingToken,
                        "no usable google token",
                    )
                    .await;
            }
            Err(TokenError::BootstrapFailed(msg)) => {
                return self
                    .fail_session(job_id, session, ScanErrorCode::TokenBootstrapFailed, &msg)
                    .await;
            }
            Err(TokenError::Db(err)) => return Err(format!("token lookup failed: {err}")),
        };

        let query = build_query(
            options.days_back,
            options.query_mode,
            options.include_promotions,
        );
        let driver = GmailDriver::new(
            token,
            query.clone(),
            options.page_size,
            options.mailbox_timeouts(),
        );

        let directory_snapshot = directory::cached_directory(&self.pool)
            .await
            .map_err(|e| format!("failed to load merchant directory: {e}"))?;
        let overrides = directory::load_overrides(&self.pool, &session.user_id)
            .await
            .map_err(|e| format!("failed to load overrides: {e}"))?;

        log::info!(
            "session {}: chunk starting (page {}, cursor {:?})",
            session.id,
            session.pages + 1,
            cursor
        );

        // Chunks may outlive one lease period (deep mode allows 45 s), so a
        // background task keeps renewing while the chunk runs.
        let renewer = {
            let sessions = SessionStore::new(self.pool.clone());
            let session_id = session.id.clone();
            let worker_id = self.worker_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
                    match sessions.renew_lease(&session_id, &worker_id).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(err) => {
                            log::warn!("session {session_id}: lease renewal failed: {err}");
                        }
                    }
                }
            })
        };

        let engine = ChunkEngine::new(&driver, options, &directory_snapshot, &overrides, query);
        let run_result = engine.run(cursor, chrono::Utc::now()).await;
        renewer.abort();

        let outcome = match run_result {
            Ok(outcome) => outcome,
            Err(err) => {
                let code = match &err {
                    DriverError::Auth(_) => ScanErrorCode::AuthFailed,
                    DriverError::Network(_) | DriverError::Timeout { .. } => {
                        ScanErrorCode::NetworkError
                    }
                    DriverError::Http { .. } => ScanErrorCode::GmailListFailed,
                    DriverError::Protocol(_) => ScanErrorCode::ChunkError,
                };
                return self
                    .fail_session(job_id, session, code, &err.to_string())
                    .await;
            }
        };

        self.finish_chunk(job_id, session, options, outcome).await
    }

    async fn finish_chunk(
        &self,
        job_id: i32,
        session: &Session,
        options: &ScanOptions,
        outcome: ChunkOutcome,
    ) -> Result<(), String> {
        let ChunkOutcome {
            candidates,
            next_cursor,
            stats,
        } = outcome;

        if !self
            .sessions
            .renew_lease(&session.id, &self.worker_id)
            .await
            .map_err(|e| e.to_string())?
        {
            // Lease lost mid-chunk: drop our results, the new holder redoes
            // the chunk and the dedupe keys keep effects single.
            log::warn!("session {}: lease lost, discarding chunk", session.id);
            self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        }

        let inserted = self
            .candidates
            .insert_new(&session.id, &session.user_id, &candidates)
            .await
            .map_err(|e| format!("failed to persist candidates: {e}"))?;
        let found_delta = inserted.len() as i64;
        let scanned_delta = i64::from(stats.scanned);

        let stats_json = serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null);
        self.sessions
            .update_progress(
                &session.id,
                scanned_delta,
                found_delta,
                next_cursor.as_deref(),
                stats_json.clone(),
            )
            .await
            .map_err(|e| format!("failed to update progress: {e}"))?;

        let pages = session.pages + 1;
        let scanned_total = session.scanned_total + scanned_delta;
        let found_total = session.found_total + found_delta;
        let cursor_tag = next_cursor.as_deref().unwrap_or("end");

        self.emit(
            session,
            EventType::Progress,
            json!({
                "phase": "scanning",
                "pages": pages,
                "cursor": next_cursor,
                "scannedTotal": scanned_total,
                "foundTotal": found_total,
                "stats": stats_json,
            }),
            &format!("progress:{pages}:{cursor_tag}"),
        )
        .await;

        if found_delta > 0 {
            self.emit(
                session,
                EventType::Candidates,
                json!({ "candidates": inserted }),
                &format!("candidates:{pages}:{cursor_tag}"),
            )
            .await;
        }

        log::info!(
            "session {}: chunk done (page {pages}, +{found_delta} candidates, {} scanned, {} ms)",
            session.id,
            stats.scanned,
            stats.took_ms
        );

        let finished = next_cursor.is_none()
            || pages >= options.max_pages as i32
            || found_total >= i64::from(options.max_candidates);
        if finished {
            self.sessions
                .mark_done(&session.id)
                .await
                .map_err(|e| format!("failed to mark done: {e}"))?;
            self.emit(
                session,
                EventType::Done,
                json!({
                    "pages": pages,
                    "scannedTotal": scanned_total,
                    "foundTotal": found_total,
                }),
                "done",
            )
            .await;
            self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        }

        // Brief pacing, then re-read the session so an external cancel
        // observed between chunks stops the scan.
        tokio::time::sleep(INTER_CHUNK_PAUSE).await;
        match self.sessions.status(&session.id).await {
            Ok(Some(SessionStatus::Canceled)) => {
                self.emit_canceled_done(session).await;
                self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => log::warn!("session {}: cancel check failed: {err}", session.id),
        }

        if let Err(err) = self
            .queue
            .enqueue_chunk(&session.id, next_cursor.as_deref())
            .await
        {
            // The session keeps its cursor; /run can re-enqueue it.
            log::error!("session {}: failed to enqueue next chunk: {err}", session.id);
            self.queue
                .fail_job(job_id, &format!("enqueue failed: {err}"))
                .await
                .map_err(|e| e.to_string())?;
            return Ok(());
        }

        self.queue.complete_job(job_id).await.map_err(|e| e.to_string())?;
        Ok(())
    }
}
