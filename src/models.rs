//! Data transfer objects shared by the scan pipeline and the API.
//!
//! Every struct in this module derives `JsonSchema` so `rocket_okapi` can
//! describe the payloads accurately in the generated OpenAPI document. Enums
//! that are persisted also derive `sqlx::Type` against the matching Postgres
//! enum types created in `migrations/`.

use chrono::{DateTime, NaiveDate, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Mailbox provider a session scans against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "provider", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Imap,
}

/// Lifecycle state of a scan session. Terminal states are sticky.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Running,
    Done,
    Canceled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Canceled | SessionStatus::Error
        )
    }
}

/// One scanning job bound to (user, provider).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier (UUID v4, stringly on the wire).
    pub id: String,
    /// Owner user subject from the bearer token.
    pub user_id: String,
    /// Mailbox provider.
    pub provider: Provider,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Opaque provider continuation token, null once exhausted.
    pub cursor: Option<String>,
    /// Budget options captured at session creation (already clamped).
    pub options: JsonValue,
    /// Chunks processed so far. Monotonically non-decreasing.
    pub pages: i32,
    /// Messages screened across all chunks. Monotonically non-decreasing.
    pub scanned_total: i64,
    /// Candidates persisted across all chunks. Monotonically non-decreasing.
    pub found_total: i64,
    /// Stats snapshot from the most recent chunk.
    pub last_stats: Option<JsonValue>,
    /// Failure code when status is `error`.
    pub error_code: Option<String>,
    /// One-line failure description when status is `error`.
    pub error_message: Option<String>,
    /// Worker currently holding the lease, if any.
    pub leased_by: Option<String>,
    /// Lease expiry; the session may be stolen after this instant.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

/// Event types visible to SSE clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Hello,
    Progress,
    Candidates,
    Done,
    Error,
    Ping,
}

impl EventType {
    /// Wire name used as the SSE `event:` field.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Hello => "hello",
            EventType::Progress => "progress",
            EventType::Candidates => "candidates",
            EventType::Done => "done",
            EventType::Error => "error",
            EventType::Ping => "ping",
        }
    }
}

/// Append-only event row, ordered by `id` within a session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Monotonic per-session position.
    pub id: i64,
    pub session_id: String,
    pub user_id: String,
    pub event_type: EventType,
    /// Opaque JSON payload forwarded verbatim over SSE.
    pub payload: JsonValue,
    /// Idempotency key; at most one row per (session, key).
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Billing cadence guess attached to a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Weekly => "weekly",
            Cadence::Biweekly => "biweekly",
            Cadence::Monthly => "monthly",
            Cadence::Quarterly => "quarterly",
            Cadence::Yearly => "yearly",
        }
    }
}

/// Bucketed confidence shown to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConfidenceLabel {
    Low,
    Medium,
    High,
}

impl ConfidenceLabel {
    /// Thresholds: >= 80 High, >= 55 Medium, else Low.
    pub fn from_confidence(confidence: i32) -> Self {
        if confidence >= 80 {
            ConfidenceLabel::High
        } else if confidence >= 55 {
            ConfidenceLabel::Medium
        } else {
            ConfidenceLabel::Low
        }
    }
}

/// What kind of evidence backs a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Transactional,
    PlatformReceipt,
    Trial,
    Cluster,
    Unknown,
}

/// Billing event class inferred for the best representative message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateEventType {
    Receipt,
    Renewal,
    Trial,
    PaymentFailed,
    Paused,
    Cancellation,
    BillingSignal,
    BillingSignalNoAmount,
    Marketing,
    Unknown,
    TopUp,
    AdSpend,
    Promo,
}

impl CandidateEventType {
    /// Ranking weight used when picking the best candidate per merchant.
    pub fn priority(self) -> i64 {
        match self {
            CandidateEventType::Receipt => 100,
            CandidateEventType::Renewal => 90,
            CandidateEventType::BillingSignal => 80,
            CandidateEventType::BillingSignalNoAmount => 70,
            CandidateEventType::Trial => 60,
            CandidateEventType::PaymentFailed => 50,
            CandidateEventType::Paused => 40,
            CandidateEventType::Cancellation => 35,
            CandidateEventType::Unknown => 20,
            CandidateEventType::Marketing => 0,
            // Gated classes never survive post-processing; rank with marketing.
            CandidateEventType::TopUp | CandidateEventType::AdSpend | CandidateEventType::Promo => 0,
        }
    }
}

/// Best representative message backing a candidate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    /// Raw `From` header.
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub sender_email: String,
    pub sender_domain: String,
    /// Message date, epoch milliseconds.
    pub date_ms: i64,
}

/// Compact evidence sample attached under `evidenceSamples`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceSample {
    pub from: String,
    pub subject: String,
    pub date_ms: i64,
}

/// One deduplicated subscription candidate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Stable dedupe hash; unique per session.
    pub fingerprint: String,
    pub merchant: String,
    pub plan: Option<String>,
    pub amount: Option<f64>,
    /// ISO 4217 currency code when an amount was extracted.
    pub currency: Option<String>,
    pub cadence_guess: Option<Cadence>,
    /// Guessed next charge date.
    pub next_date_guess: Option<NaiveDate>,
    /// 0–100.
    pub confidence: i32,
    pub confidence_label: ConfidenceLabel,
    pub evidence_type: EvidenceType,
    /// Ordered, human-readable scoring reasons.
    pub reasons: Vec<String>,
    pub evidence: Evidence,
    /// Up to three most-recent samples, newest first.
    pub evidence_samples: Vec<EvidenceSample>,
    /// True when the candidate needs user confirmation (clusters, weak matches).
    pub needs_confirm: bool,
    pub event_type: CandidateEventType,
    /// Set to `status` for paused / payment-failed candidates.
    pub card_type: Option<String>,
    /// Amount is informational only when true.
    pub exclude_from_spend: bool,
    /// Distinct message dates observed for this fingerprint within a chunk.
    /// Aggregation state only, never serialized.
    #[serde(skip)]
    #[schemars(skip)]
    pub evidence_dates: Vec<i64>,
}

/// Low-PII sample of a message that was screened in but produced no
/// candidate; kept for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NearMiss {
    pub sender_domain: String,
    pub subject: String,
    pub reason: String,
}

/// Per-chunk execution counters returned in `progress` payloads and
/// session diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStats {
    pub engine_version: String,
    /// Ids produced by the list stage.
    pub listed: u32,
    /// Messages whose metadata was fetched.
    pub scanned: u32,
    /// Messages that survived the quick screen.
    pub screened_in: u32,
    /// Messages fully fetched.
    pub full_fetched: u32,
    /// Candidates before aggregation.
    pub raw_matched: u32,
    /// Candidates after aggregation and the strict gate.
    pub matched: u32,
    pub deadline_ms: u64,
    pub took_ms: u64,
    /// Provider query the list stage ran.
    pub query: String,
    /// Drop-reason counters for messages that produced no candidate.
    pub null_reasons: std::collections::BTreeMap<String, u32>,
    /// Up to 25 near-miss samples.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub near_misses: Vec<NearMiss>,
}
