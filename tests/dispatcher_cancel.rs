//! Dispatcher-level cancel behavior: a session canceled between chunks gets
//! its final `done {canceled:true}` event, the claimed job completes, and no
//! further chunk is enqueued.

use serde_json::json;
use subscan_api::models::{EventType, Provider, SessionStatus};
use subscan_api::scan::dispatcher::ScanDispatcher;
use subscan_api::scan::queue::ScanQueue;
use subscan_api::store::{EventLog, SessionStore};
use subscan_api::test_support::TestDatabase;

#[tokio::test]
async fn canceled_session_emits_final_done_and_stops() {
    let test_db = TestDatabase::new()
        .await
        .expect("failed to provision test database");
    let pool = test_db.pool_clone();

    let sessions = SessionStore::new(pool.clone());
    let events = EventLog::new(pool.clone());
    let queue = ScanQueue::new(pool.clone());

    // A session mid-scan: running, with its first progress event out and
    // the next chunk already enqueued.
    let session = sessions
        .create("user-1", Provider::Gmail, json!({ "mode": "quick" }))
        .await
        .expect("create session");
    sessions
        .mark_running(&session.id)
        .await
        .expect("mark running");
    events
        .append(
            &session.id,
            "user-1",
            EventType::Progress,
            json!({ "phase": "scanning", "pages": 1 }),
            Some("progress:1:page-2"),
        )
        .await
        .expect("append progress");
    queue
        .enqueue_chunk(&session.id, Some("page-2"))
        .await
        .expect("enqueue chunk")
        .expect("job is new");

    // The client cancels before the chunk runs.
    assert!(sessions.cancel(&session.id, "user-1").await.expect("cancel"));

    let dispatcher = ScanDispatcher::new(pool.clone());
    assert!(
        dispatcher.process_next().await.expect("dispatcher step"),
        "dispatcher should claim the pending job"
    );

    // The final event is done {canceled:true}, after the earlier progress.
    let polled = events
        .poll_after(&session.id, 0, 10)
        .await
        .expect("poll events");
    assert_eq!(polled.len(), 2);
    let done = polled.last().expect("done event");
    assert_eq!(done.event_type, EventType::Done);
    assert_eq!(done.payload["canceled"], true);
    assert_eq!(done.dedupe_key.as_deref(), Some("done"));

    // Session stays canceled; the job succeeded; nothing new was enqueued.
    let reloaded = sessions
        .get(&session.id)
        .await
        .expect("get session")
        .expect("session exists");
    assert_eq!(reloaded.status, SessionStatus::Canceled);

    let (queued, total): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*) FILTER (WHERE status = 'queued'), COUNT(*) FROM scan_jobs WHERE session_id = $1",
    )
    .bind(&session.id)
    .fetch_one(&pool)
    .await
    .expect("count jobs");
    assert_eq!(queued, 0, "no next chunk may be enqueued after cancel");
    assert_eq!(total, 1);

    // Redelivery is harmless: the job key dedupes the enqueue and the done
    // event dedupes, so a second dispatcher pass finds nothing to do.
    assert!(
        queue
            .enqueue_chunk(&session.id, Some("page-2"))
            .await
            .expect("re-enqueue")
            .is_none()
    );
    assert!(!dispatcher.process_next().await.expect("dispatcher idle"));

    let replayed = events
        .poll_after(&session.id, 0, 10)
        .await
        .expect("poll events again");
    assert_eq!(replayed.len(), 2, "done event must not duplicate");

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn canceled_queued_session_never_reaches_the_provider() {
    let test_db = TestDatabase::new()
        .await
        .expect("failed to provision test database");
    let pool = test_db.pool_clone();

    let sessions = SessionStore::new(pool.clone());
    let events = EventLog::new(pool.clone());
    let queue = ScanQueue::new(pool.clone());

    // Canceled while still queued, before any chunk ran. No tokens are
    // stored, so reaching the token/driver path would fail the session;
    // the cancel short-circuit must win instead.
    let session = sessions
        .create("user-1", Provider::Gmail, json!({}))
        .await
        .expect("create session");
    queue
        .enqueue_chunk(&session.id, None)
        .await
        .expect("enqueue chunk");
    assert!(sessions.cancel(&session.id, "user-1").await.expect("cancel"));

    let dispatcher = ScanDispatcher::new(pool.clone());
    assert!(dispatcher.process_next().await.expect("dispatcher step"));

    let polled = events
        .poll_after(&session.id, 0, 10)
        .await
        .expect("poll events");
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].event_type, EventType::Done);
    assert_eq!(polled[0].payload["canceled"], true);

    let reloaded = sessions
        .get(&session.id)
        .await
        .expect("get session")
        .expect("session exists");
    assert_eq!(reloaded.status, SessionStatus::Canceled);
    assert_eq!(reloaded.error_code, None);

    test_db.close().await.expect("failed to drop test database");
}
