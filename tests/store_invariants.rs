//! Store-level invariants: idempotent event writes, candidate dedupe,
//! monotonic session counters, sticky terminal states, lease stealing, and
//! deterministic job enqueues.

use serde_json::json;
use subscan_api::models::{
    Candidate, CandidateEventType, ConfidenceLabel, EventType, Evidence, EvidenceType, Provider,
    SessionStatus,
};
use subscan_api::scan::error::ScanErrorCode;
use subscan_api::scan::queue::ScanQueue;
use subscan_api::store::{CandidateStore, EventLog, SessionStore};
use subscan_api::test_support::TestDatabase;

fn candidate(fingerprint: &str, merchant: &str) -> Candidate {
    Candidate {
        fingerprint: fingerprint.to_string(),
        merchant: merchant.to_string(),
        plan: None,
        amount: Some(9.99),
        currency: Some("USD".to_string()),
        cadence_guess: None,
        next_date_guess: None,
        confidence: 70,
        confidence_label: ConfidenceLabel::Medium,
        evidence_type: EvidenceType::Transactional,
        reasons: vec!["test".to_string()],
        evidence: Evidence {
            from: format!("billing@{}.com", merchant.to_lowercase()),
            subject: format!("{merchant} receipt"),
            snippet: String::new(),
            sender_email: format!("billing@{}.com", merchant.to_lowercase()),
            sender_domain: format!("{}.com", merchant.to_lowercase()),
            date_ms: 1_700_000_000_000,
        },
        evidence_samples: vec![],
        needs_confirm: false,
        event_type: CandidateEventType::Receipt,
        card_type: None,
        exclude_from_spend: false,
        evidence_dates: vec![],
    }
}

#[tokio::test]
async fn event_log_and_candidate_dedupe() {
    let test_db = TestDatabase::new()
        .await
        .expect("failed to provision test database");
    let pool = test_db.pool_clone();

    let sessions = SessionStore::new(pool.clone());
    let session = sessions
        .create("user-1", Provider::Gmail, json!({}))
        .await
        .expect("create session");

    // Same dedupe key twice: exactly one stored row.
    let events = EventLog::new(pool.clone());
    let first = events
        .append(&session.id, "user-1", EventType::Hello, json!({}), Some("hello"))
        .await
        .expect("append");
    let second = events
        .append(&session.id, "user-1", EventType::Hello, json!({}), Some("hello"))
        .await
        .expect("append again");
    assert!(first.is_some());
    assert!(second.is_none());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_events WHERE session_id = $1")
        .bind(&session.id)
        .fetch_one(&pool)
        .await
        .expect("count events");
    assert_eq!(count, 1);

    // Events come back in id order from the poll cursor.
    events
        .append(&session.id, "user-1", EventType::Progress, json!({"pages": 1}), Some("p1"))
        .await
        .expect("append progress");
    let polled = events
        .poll_after(&session.id, 0, 10)
        .await
        .expect("poll events");
    assert_eq!(polled.len(), 2);
    assert!(polled[0].id < polled[1].id);
    assert_eq!(polled[0].event_type, EventType::Hello);

    // Candidate fingerprints dedupe per session.
    let candidates = CandidateStore::new(pool.clone());
    let inserted = candidates
        .insert_new(&session.id, "user-1", &[candidate("fp-1", "Netflix")])
        .await
        .expect("insert");
    assert_eq!(inserted.len(), 1);

    let inserted_again = candidates
        .insert_new(
            &session.id,
            "user-1",
            &[candidate("fp-1", "Netflix"), candidate("fp-2", "Spotify")],
        )
        .await
        .expect("insert again");
    assert_eq!(inserted_again.len(), 1);
    assert_eq!(inserted_again[0].fingerprint, "fp-2");

    let stored = candidates
        .list_for_session(&session.id)
        .await
        .expect("list candidates");
    assert_eq!(stored.len(), 2);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn session_lifecycle_and_queue_invariants() {
    let test_db = TestDatabase::new()
        .await
        .expect("failed to provision test database");
    let pool = test_db.pool_clone();

    let sessions = SessionStore::new(pool.clone());
    let session = sessions
        .create("user-1", Provider::Gmail, json!({"mode": "quick"}))
        .await
        .expect("create session");
    assert_eq!(session.status, SessionStatus::Queued);
    assert_eq!(session.pages, 0);

    // Enqueue twice for the same (session, cursor): one effective job.
    let queue = ScanQueue::new(pool.clone());
    let first = queue.enqueue_chunk(&session.id, None).await.expect("enqueue");
    let second = queue.enqueue_chunk(&session.id, None).await.expect("enqueue again");
    assert!(first.is_some());
    assert!(second.is_none());

    let job = queue
        .claim_next()
        .await
        .expect("claim")
        .expect("job available");
    assert_eq!(job.session_id, session.id);
    assert!(queue.claim_next().await.expect("claim").is_none());

    // Lease: held by A, not stealable by B until expiry.
    let leased = sessions
        .acquire_lease(&session.id, "worker-a")
        .await
        .expect("lease query");
    assert!(leased.is_some());
    let stolen = sessions
        .acquire_lease(&session.id, "worker-b")
        .await
        .expect("lease query");
    assert!(stolen.is_none(), "live lease must not be stolen");

    // Simulate expiry; now B may steal.
    sqlx::query("UPDATE scan_sessions SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(&session.id)
        .execute(&pool)
        .await
        .expect("expire lease");
    let stolen = sessions
        .acquire_lease(&session.id, "worker-b")
        .await
        .expect("lease query");
    assert!(stolen.is_some(), "expired lease must be stealable");
    assert!(
        !sessions
            .renew_lease(&session.id, "worker-a")
            .await
            .expect("renew query"),
        "old holder must not renew a stolen lease"
    );

    // Counters only grow.
    sessions.mark_running(&session.id).await.expect("mark running");
    sessions
        .update_progress(&session.id, 40, 3, Some("page-2"), json!({"tookMs": 1200}))
        .await
        .expect("progress");
    sessions
        .update_progress(&session.id, 10, 0, None, json!({"tookMs": 900}))
        .await
        .expect("progress");

    let reloaded = sessions
        .get(&session.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(reloaded.pages, 2);
    assert_eq!(reloaded.scanned_total, 50);
    assert_eq!(reloaded.found_total, 3);
    assert_eq!(reloaded.cursor, None);

    // Terminal states are sticky.
    assert!(sessions.mark_done(&session.id).await.expect("done"));
    assert!(!sessions.cancel(&session.id, "user-1").await.expect("cancel"));
    sessions
        .mark_error(&session.id, ScanErrorCode::Unknown, "late failure")
        .await
        .expect("error query");
    let terminal = sessions
        .get(&session.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(terminal.status, SessionStatus::Done);
    assert_eq!(terminal.error_code, None);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn cancel_is_observable_between_chunks() {
    let test_db = TestDatabase::new()
        .await
        .expect("failed to provision test database");
    let pool = test_db.pool_clone();

    let sessions = SessionStore::new(pool.clone());
    let session = sessions
        .create("user-1", Provider::Gmail, json!({}))
        .await
        .expect("create session");
    sessions.mark_running(&session.id).await.expect("running");

    assert!(sessions.cancel(&session.id, "user-1").await.expect("cancel"));
    assert_eq!(
        sessions.status(&session.id).await.expect("status"),
        Some(SessionStatus::Canceled)
    );

    // A canceled session cannot be leased for further chunks.
    let leased = sessions
        .acquire_lease(&session.id, "worker-a")
        .await
        .expect("lease query");
    assert!(leased.is_none());

    test_db.close().await.expect("failed to drop test database");
}
