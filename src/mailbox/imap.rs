//! IMAP mailbox driver.
//!
//! Connects over TLS (or plain TCP for test servers), examines INBOX
//! read-only, and pages through `UID SEARCH SINCE <daysBack>` results. The
//! cursor is `base64url({"uid": lastProcessedUid})`; a resumed scan only
//! sees uids strictly greater than the cursor uid.

use crate::mailbox::{
    Deadline, DriverError, FullMessage, ListPage, MailboxDriver, MailboxTimeouts, MessageBodies,
    MessageMeta, timed,
};
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use futures::TryStreamExt;
use mailparse::{MailHeaderMap, ParsedMail};
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// IMAP connection settings supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS on connect. Plain TCP is only meant for local test servers.
    #[serde(default = "default_secure")]
    pub secure: bool,
    pub username: String,
    pub password: String,
}

const fn default_port() -> u16 {
    993
}

const fn default_secure() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    uid: u32,
}

/// Encode a continuation cursor for the last processed uid.
pub fn encode_cursor(uid: u32) -> String {
    let json = serde_json::to_vec(&CursorPayload { uid }).expect("cursor serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a continuation cursor; malformed cursors read as "start over".
pub fn decode_cursor(cursor: &str) -> Option<u32> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    serde_json::from_slice::<CursorPayload>(&bytes)
        .ok()
        .map(|p| p.uid)
}

/// Mailbox facts reported by the verify endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImapVerify {
    pub mailbox: String,
    pub message_count: u32,
    pub capabilities: Vec<String>,
}

enum ImapSession {
    Tls(Session<TlsStream<TcpStream>>),
    Plain(Session<TcpStream>),
}

fn map_imap_error(err: async_imap::error::Error) -> DriverError {
    use async_imap::error::Error;
    match err {
        Error::Io(io) => DriverError::Network(io.to_string()),
        Error::No(msg) => DriverError::Protocol(format!("server said NO: {msg}")),
        Error::Bad(msg) => DriverError::Protocol(format!("server said BAD: {msg}")),
        other => DriverError::Protocol(other.to_string()),
    }
}

fn first_part_of<'a>(mail: &'a ParsedMail<'a>, mime_type: &str) -> Option<String> {
    if mail.ctype.mimetype.eq_ignore_ascii_case(mime_type) {
        return mail.get_body().ok();
    }
    for part in &mail.subparts {
        if let Some(body) = first_part_of(part, mime_type) {
            return Some(body);
        }
    }
    None
}

fn meta_from_headers(uid: u32, raw_headers: &[u8], internal_date_ms: Option<i64>) -> MessageMeta {
    let parsed = match mailparse::parse_mail(raw_headers) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::debug!("uid {uid}: header parse failed: {err}");
            return MessageMeta {
                id: uid.to_string(),
                date_ms: internal_date_ms,
                ..Default::default()
            };
        }
    };

    let header = |name: &str| parsed.headers.get_first_value(name);
    let date_ms = header("Date")
        .and_then(|raw| dateparser::parse(&raw).ok())
        .map(|dt| dt.timestamp_millis())
        .or(internal_date_ms);

    MessageMeta {
        id: uid.to_string(),
        from: header("From").unwrap_or_default(),
        reply_to: header("Reply-To"),
        return_path: header("Return-Path"),
        subject: header("Subject").unwrap_or_default(),
        snippet: String::new(),
        list_unsubscribe: header("List-Unsubscribe"),
        list_id: header("List-Id"),
        precedence: header("Precedence"),
        auto_submitted: header("Auto-Submitted"),
        date_ms,
    }
}

fn bodies_from_source(source: &[u8]) -> MessageBodies {
    match mailparse::parse_mail(source) {
        Ok(parsed) => {
            let text = first_part_of(&parsed, "text/plain")
                .or_else(|| parsed.get_body().ok())
                .unwrap_or_default();
            let html = first_part_of(&parsed, "text/html").unwrap_or_default();
            MessageBodies { text, html }
        }
        Err(err) => {
            log::debug!("body parse failed: {err}");
            MessageBodies::default()
        }
    }
}

/// Page a sorted uid set: uids strictly greater than `after_uid`, at most
/// `page_size` of them, plus the uid a follow-up call resumes from (None
/// when the page drained the set).
fn page_after(uids: &[u32], after_uid: u32, page_size: usize) -> (Vec<u32>, Option<u32>) {
    let remaining: Vec<u32> = uids.iter().copied().filter(|uid| *uid > after_uid).collect();
    let page: Vec<u32> = remaining.iter().copied().take(page_size).collect();
    let next = if remaining.len() > page.len() {
        page.last().copied()
    } else {
        None
    };
    (page, next)
}

/// Format a date for `SEARCH SINCE` (RFC 3501, e.g. `12-Nov-2025`).
fn since_date(days_back: i64) -> String {
    (Utc::now() - ChronoDuration::days(days_back))
        .format("%d-%b-%Y")
        .to_string()
}

/// IMAP driver over an authenticated session.
pub struct ImapDriver {
    session: Mutex<ImapSession>,
    days_back: i64,
    page_size: u32,
    timeouts: MailboxTimeouts,
}

macro_rules! with_session {
    ($guard:expr, $session:ident => $body:expr) => {
        match &mut *$guard {
            ImapSession::Tls($session) => $body,
            ImapSession::Plain($session) => $body,
        }
    };
}

impl ImapDriver {
    /// Connect, authenticate, and EXAMINE INBOX read-only.
    pub async fn connect(
        config: &ImapConfig,
        days_back: i64,
        page_size: u32,
        timeouts: MailboxTimeouts,
    ) -> Result<Self, DriverError> {
        let session = Self::open_session(config).await?;
        let driver = Self {
            session: Mutex::new(session),
            days_back,
            page_size,
            timeouts,
        };
        {
            let mut guard = driver.session.lock().await;
            with_session!(guard, session => {
                session.examine("INBOX").await.map_err(map_imap_error)?;
            });
        }
        Ok(driver)
    }

    async fn open_session(config: &ImapConfig) -> Result<ImapSession, DriverError> {
        let address = (config.host.as_str(), config.port);
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| DriverError::Network(e.to_string()))?;

        if config.secure {
            let tls = async_native_tls::TlsConnector::new();
            let stream = tls
                .connect(config.host.as_str(), tcp)
                .await
                .map_err(|e| DriverError::Network(e.to_string()))?;
            let client = async_imap::Client::new(stream);
            let session = client
                .login(&config.username, &config.password)
                .await
                .map_err(|(err, _)| DriverError::Auth(err.to_string()))?;
            Ok(ImapSession::Tls(session))
        } else {
            let client = async_imap::Client::new(tcp);
            let session = client
                .login(&config.username, &config.password)
                .await
                .map_err(|(err, _)| DriverError::Auth(err.to_string()))?;
            Ok(ImapSession::Plain(session))
        }
    }

    /// Connect and report mailbox facts for the verify endpoint.
    pub async fn verify(config: &ImapConfig) -> Result<ImapVerify, DriverError> {
        let session = Self::open_session(config).await?;
        let mut session = session;
        let (capabilities, exists) = match &mut session {
            ImapSession::Tls(s) => {
                let caps = s.capabilities().await.map_err(map_imap_error)?;
                let mailbox = s.examine("INBOX").await.map_err(map_imap_error)?;
                (
                    caps.iter().map(|c| format!("{c:?}")).collect::<Vec<_>>(),
                    mailbox.exists,
                )
            }
            ImapSession::Plain(s) => {
                let caps = s.capabilities().await.map_err(map_imap_error)?;
                let mailbox = s.examine("INBOX").await.map_err(map_imap_error)?;
                (
                    caps.iter().map(|c| format!("{c:?}")).collect::<Vec<_>>(),
                    mailbox.exists,
                )
            }
        };
        Ok(ImapVerify {
            mailbox: "INBOX".to_string(),
            message_count: exists,
            capabilities,
        })
    }

    async fn search_uids(&self) -> Result<Vec<u32>, DriverError> {
        let query = format!("SINCE {}", since_date(self.days_back));
        let mut guard = self.session.lock().await;
        let uids = with_session!(guard, session => {
            session.uid_search(&query).await.map_err(map_imap_error)?
        });
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_one(
        &self,
        uid: &str,
        items: &str,
    ) -> Result<Option<(u32, Option<i64>, Vec<u8>, Vec<u8>)>, DriverError> {
        let mut guard = self.session.lock().await;
        let fetched = with_session!(guard, session => {
            let stream = session
                .uid_fetch(uid, items)
                .await
                .map_err(map_imap_error)?;
            let messages: Vec<_> = stream.try_collect().await.map_err(map_imap_error)?;
            messages
        });

        let Some(fetch) = fetched.first() else {
            return Ok(None);
        };
        let uid = fetch.uid.unwrap_or_else(|| uid.parse().unwrap_or(0));
        let internal_date_ms = fetch.internal_date().map(|dt| dt.timestamp_millis());
        let header = fetch.header().map(<[u8]>::to_vec).unwrap_or_default();
        let body = fetch.body().map(<[u8]>::to_vec).unwrap_or_default();
        Ok(Some((uid, internal_date_ms, header, body)))
    }
}

#[async_trait]
impl MailboxDriver for ImapDriver {
    async fn list_page(
        &self,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<ListPage, DriverError> {
        let after_uid = cursor.and_then(decode_cursor).unwrap_or(0);
        let uids = timed(self.timeouts.list, deadline, self.search_uids()).await?;

        let (page, next_uid) = page_after(&uids, after_uid, self.page_size as usize);
        Ok(ListPage {
            ids: page.into_iter().map(|uid| uid.to_string()).collect(),
            next_cursor: next_uid.map(encode_cursor),
        })
    }

    async fn fetch_metadata(
        &self,
        id: &str,
        deadline: &Deadline,
    ) -> Result<MessageMeta, DriverError> {
        let fetched = timed(
            self.timeouts.meta,
            deadline,
            self.fetch_one(id, "(UID INTERNALDATE BODY.PEEK[HEADER])"),
        )
        .await?;
        let Some((uid, internal_date_ms, header, _)) = fetched else {
            return Err(DriverError::Protocol(format!("uid {id} not found")));
        };
        Ok(meta_from_headers(uid, &header, internal_date_ms))
    }

    async fn fetch_full(&self, id: &str, deadline: &Deadline) -> Result<FullMessage, DriverError> {
        let fetched = timed(
            self.timeouts.full,
            deadline,
            self.fetch_one(id, "(UID INTERNALDATE BODY.PEEK[])"),
        )
        .await?;
        let Some((uid, internal_date_ms, _, body)) = fetched else {
            return Err(DriverError::Protocol(format!("uid {id} not found")));
        };

        let mut meta = meta_from_headers(uid, &body, internal_date_ms);
        let bodies = bodies_from_source(&body);
        if meta.snippet.is_empty() {
            meta.snippet = bodies.text.chars().take(140).collect();
        }
        Ok(FullMessage { meta, bodies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = encode_cursor(4_210);
        assert_eq!(decode_cursor(&cursor), Some(4_210));
        assert_eq!(decode_cursor("not-base64!!"), None);
        assert_eq!(decode_cursor(""), None);
    }

    #[test]
    fn test_cursor_is_urlsafe_json() {
        let cursor = encode_cursor(200);
        let decoded = URL_SAFE_NO_PAD.decode(&cursor).unwrap();
        assert_eq!(String::from_utf8_lossy(&decoded), r#"{"uid":200}"#);
    }

    #[test]
    fn test_meta_from_headers() {
        let raw = concat!(
            "From: Hulu <billing@hulu.com>\r\n",
            "Subject: Your Hulu receipt\r\n",
            "Date: Wed, 12 Nov 2025 09:30:00 +0000\r\n",
            "List-Id: <receipts.hulu.com>\r\n",
            "\r\n",
        );
        let meta = meta_from_headers(42, raw.as_bytes(), None);
        assert_eq!(meta.id, "42");
        assert_eq!(meta.from, "Hulu <billing@hulu.com>");
        assert_eq!(meta.subject, "Your Hulu receipt");
        assert!(meta.date_ms.is_some());
        assert!(meta.list_id.is_some());
    }

    #[test]
    fn test_bodies_from_multipart_source() {
        let raw = concat!(
            "From: a@b.c\r\n",
            "Subject: hi\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"xyz\"\r\n",
            "\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "You were charged $9.99\r\n",
            "--xyz\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>You were charged $9.99</p>\r\n",
            "--xyz--\r\n",
        );
        let bodies = bodies_from_source(raw.as_bytes());
        assert!(bodies.text.contains("charged $9.99"));
        assert!(bodies.html.contains("<p>"));
    }

    #[test]
    fn test_resumable_paging() {
        // 500 matching uids, pages of 200.
        let uids: Vec<u32> = (1..=500).collect();

        let (page, next) = page_after(&uids, 0, 200);
        assert_eq!(page.len(), 200);
        assert_eq!(page.last().copied(), Some(200));
        assert_eq!(next, Some(200));

        // A resumed call sees uids strictly greater than the cursor uid.
        let cursor = encode_cursor(next.unwrap());
        let after = decode_cursor(&cursor).unwrap();
        let (page, next) = page_after(&uids, after, 200);
        assert_eq!(page.first().copied(), Some(201));
        assert_eq!(page.last().copied(), Some(400));
        assert_eq!(next, Some(400));

        // Final page drains the set and ends the cursor chain.
        let (page, next) = page_after(&uids, 400, 200);
        assert_eq!(page.len(), 100);
        assert_eq!(next, None);
    }

    #[test]
    fn test_since_date_format() {
        let date = since_date(0);
        // e.g. `01-Aug-2026`: two digits, dash, three letters, dash, year.
        assert_eq!(date.len(), 11);
        assert_eq!(date.chars().filter(|c| *c == '-').count(), 2);
    }
}
