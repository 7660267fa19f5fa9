//! Mailbox access layer.
//!
//! Both providers (Gmail REST, IMAP) implement the same three-stage contract:
//! list a page of message ids, fetch cheap metadata for screening, and fetch
//! full bodies for the messages that survive screening. Every operation runs
//! under a per-operation timeout and the enclosing chunk deadline, whichever
//! is tighter, and transient provider failures are retried with exponential
//! backoff and jitter.

pub mod gmail;
pub mod imap;
pub mod token;

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Headroom reserved before the hard deadline so partial results can be
/// aggregated and flushed.
pub const FLUSH_MARGIN: Duration = Duration::from_millis(900);

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Wall-clock budget for one chunk. Workers consult `should_stop` between
/// operations and bail early; expiry is a normal exit, never an error.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// True once less than the flush margin remains.
    pub fn should_stop(&self) -> bool {
        Instant::now() + FLUSH_MARGIN >= self.at
    }

    /// Time left before the hard ceiling (zero when expired).
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Tighter of the per-operation timeout and the chunk budget.
    pub fn cap(&self, op_timeout: Duration) -> Duration {
        op_timeout.min(self.remaining())
    }
}

/// Per-operation timeouts a driver runs under, already clamped by the
/// options layer.
#[derive(Debug, Clone, Copy)]
pub struct MailboxTimeouts {
    pub list: Duration,
    pub meta: Duration,
    pub full: Duration,
    pub attach: Duration,
}

/// Message headers and snippet, enough for screening without a body fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    /// Provider message id (Gmail id / IMAP uid as string).
    pub id: String,
    /// Raw `From` header.
    pub from: String,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub subject: String,
    pub snippet: String,
    pub list_unsubscribe: Option<String>,
    pub list_id: Option<String>,
    pub precedence: Option<String>,
    pub auto_submitted: Option<String>,
    /// Message date, epoch milliseconds, when parseable.
    pub date_ms: Option<i64>,
}

/// Decoded message bodies.
#[derive(Debug, Clone, Default)]
pub struct MessageBodies {
    pub text: String,
    pub html: String,
}

/// Metadata plus decoded bodies.
#[derive(Debug, Clone)]
pub struct FullMessage {
    pub meta: MessageMeta,
    pub bodies: MessageBodies,
}

/// One page of message ids plus the continuation cursor, if any.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub ids: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Provider failure taxonomy shared by both drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("provider returned status {status}")]
    Http { status: u16, body: String },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out after {ms} ms")]
    Timeout { ms: u64 },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// Transient failures worth a backoff retry: HTTP 429/403/5xx,
    /// network resets, and per-operation timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Http { status, .. } => {
                matches!(status, 429 | 403 | 500 | 502 | 503 | 504)
            }
            DriverError::Network(_) | DriverError::Timeout { .. } => true,
            DriverError::Auth(_) | DriverError::Protocol(_) => false,
        }
    }
}

/// Shared mailbox contract implemented by the Gmail and IMAP drivers.
#[async_trait]
pub trait MailboxDriver: Send + Sync {
    /// List up to one provider page of message ids from `cursor`.
    async fn list_page(
        &self,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<ListPage, DriverError>;

    /// Fetch screening metadata for one message.
    async fn fetch_metadata(&self, id: &str, deadline: &Deadline)
        -> Result<MessageMeta, DriverError>;

    /// Fetch and decode full bodies for one message.
    async fn fetch_full(&self, id: &str, deadline: &Deadline) -> Result<FullMessage, DriverError>;
}

/// Run `fut` under the tighter of `op_timeout` and the chunk deadline.
pub async fn timed<T>(
    op_timeout: Duration,
    deadline: &Deadline,
    fut: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    let budget = deadline.cap(op_timeout);
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            ms: budget.as_millis() as u64,
        }),
    }
}

/// Retry a provider operation up to three attempts with exponential backoff
/// plus jitter. Never sleeps past the chunk deadline.
pub async fn with_retries<T, F, Fut>(
    op_name: &str,
    deadline: &Deadline,
    mut op: F,
) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS && !deadline.should_stop() => {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..125));
                let sleep = (backoff + jitter).min(deadline.remaining());
                log::debug!(
                    "{op_name}: attempt {attempt} failed ({err}), retrying in {:?}",
                    sleep
                );
                tokio::time::sleep(sleep).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 403, 500, 502, 503, 504] {
            assert!(
                DriverError::Http {
                    status,
                    body: String::new()
                }
                .is_retryable(),
                "status {status} should be retryable"
            );
        }
        assert!(
            !DriverError::Http {
                status: 404,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!DriverError::Auth("nope".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_with_retries_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let deadline = Deadline::after(Duration::from_secs(10));

        let result = with_retries("test", &deadline, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DriverError::Network("reset".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let deadline = Deadline::after(Duration::from_secs(10));

        let result: Result<(), _> = with_retries("test", &deadline, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::Http {
                status: 503,
                body: String::new(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_deadline_stop_margin() {
        let expired = Deadline::after(Duration::from_millis(100));
        assert!(expired.should_stop());

        let roomy = Deadline::after(Duration::from_secs(30));
        assert!(!roomy.should_stop());
        assert!(roomy.cap(Duration::from_secs(5)) <= Duration::from_secs(5));
    }
}
