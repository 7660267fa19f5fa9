//! Gmail REST driver.
//!
//! Talks to the Gmail API (`users/me/messages`) with a bearer access token.
//! The list stage runs a transactional-focused search query; metadata fetches
//! request only the headers screening needs; full fetches decode base64url
//! part bodies and follow small externalized attachments.

use crate::mailbox::{
    Deadline, DriverError, FullMessage, ListPage, MailboxDriver, MessageBodies, MessageMeta,
    MailboxTimeouts, timed, with_retries,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Body parts externalized as attachments are only fetched up to this size.
const MAX_ATTACHMENT_BYTES: u64 = 250 * 1024;

/// Headers requested by the metadata fetch.
const METADATA_HEADERS: &[&str] = &[
    "From",
    "Subject",
    "Date",
    "Reply-To",
    "Return-Path",
    "List-Unsubscribe",
    "List-Id",
    "Precedence",
    "Auto-Submitted",
];

/// Search terms for `queryMode=transactions`.
const TRANSACTIONAL_TERMS: &str = "(receipt OR invoice OR \"payment\" OR subscription OR renewal OR \"order confirmation\" OR billing OR \"free trial\")";

/// Build the Gmail search query for a scan.
pub fn build_query(
    days_back: i64,
    query_mode: crate::scan::options::QueryMode,
    include_promotions: bool,
) -> String {
    use crate::scan::options::QueryMode;
    match query_mode {
        QueryMode::Transactions => format!(
            "in:anywhere newer_than:{days_back}d -category:promotions -category:social {TRANSACTIONAL_TERMS}"
        ),
        QueryMode::Broad => {
            let mut query = format!("in:anywhere newer_than:{days_back}d -in:chats");
            if !include_promotions {
                query.push_str(" -category:promotions -category:social");
            }
            query
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    id: String,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Payload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Payload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    size: u64,
    data: Option<String>,
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: Option<String>,
}

fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .ok()
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn meta_from_response(response: &MessageResponse) -> MessageMeta {
    let headers = response
        .payload
        .as_ref()
        .map(|p| p.headers.as_slice())
        .unwrap_or_default();

    // internalDate is epoch ms; the Date header is only a fallback.
    let date_ms = response
        .internal_date
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .or_else(|| {
            header_value(headers, "Date")
                .and_then(|raw| dateparser::parse(raw).ok())
                .map(|dt| dt.timestamp_millis())
        });

    MessageMeta {
        id: response.id.clone(),
        from: header_value(headers, "From").unwrap_or_default().to_string(),
        reply_to: header_value(headers, "Reply-To").map(str::to_string),
        return_path: header_value(headers, "Return-Path").map(str::to_string),
        subject: header_value(headers, "Subject").unwrap_or_default().to_string(),
        snippet: response.snippet.clone(),
        list_unsubscribe: header_value(headers, "List-Unsubscribe").map(str::to_string),
        list_id: header_value(headers, "List-Id").map(str::to_string),
        precedence: header_value(headers, "Precedence").map(str::to_string),
        auto_submitted: header_value(headers, "Auto-Submitted").map(str::to_string),
        date_ms,
    }
}

/// Walk the MIME tree collecting decoded text and HTML bodies. Parts whose
/// data was externalized return attachment references for the caller to
/// resolve.
fn collect_bodies(payload: &Payload, bodies: &mut MessageBodies, pending: &mut Vec<(String, String)>) {
    let is_text = payload.mime_type.eq_ignore_ascii_case("text/plain");
    let is_html = payload.mime_type.eq_ignore_ascii_case("text/html");

    if is_text || is_html {
        if let Some(body) = payload.body.as_ref() {
            if let Some(decoded) = body.data.as_deref().and_then(decode_base64url) {
                let text = String::from_utf8_lossy(&decoded);
                if is_text {
                    bodies.text.push_str(&text);
                } else {
                    bodies.html.push_str(&text);
                }
            } else if let Some(attachment_id) = body.attachment_id.as_deref() {
                if body.size <= MAX_ATTACHMENT_BYTES {
                    pending.push((payload.mime_type.clone(), attachment_id.to_string()));
                }
            }
        }
    }
    for part in &payload.parts {
        collect_bodies(part, bodies, pending);
    }
}

/// Gmail mailbox driver. One instance serves one session chunk.
pub struct GmailDriver {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    query: String,
    page_size: u32,
    timeouts: MailboxTimeouts,
}

impl GmailDriver {
    pub fn new(
        access_token: String,
        query: String,
        page_size: u32,
        timeouts: MailboxTimeouts,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token,
            query,
            page_size,
            timeouts,
        }
    }

    /// Point the driver at a different API root (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, DriverError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| DriverError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 401 {
            return Err(DriverError::Auth("access token rejected".to_string()));
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Http { status, body });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
        deadline: &Deadline,
    ) -> Result<Option<String>, DriverError> {
        let url = format!(
            "{}/users/me/messages/{message_id}/attachments/{attachment_id}",
            self.base_url
        );
        let attachment: AttachmentResponse = timed(
            self.timeouts.attach,
            deadline,
            self.get_json(url, &[]),
        )
        .await?;
        Ok(attachment
            .data
            .as_deref()
            .and_then(decode_base64url)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[async_trait]
impl MailboxDriver for GmailDriver {
    async fn list_page(
        &self,
        cursor: Option<&str>,
        deadline: &Deadline,
    ) -> Result<ListPage, DriverError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("q", self.query.clone()),
            ("maxResults", self.page_size.to_string()),
        ];
        if let Some(token) = cursor {
            query.push(("pageToken", token.to_string()));
        }

        let response: ListResponse = with_retries("gmail list", deadline, || {
            timed(self.timeouts.list, deadline, self.get_json(url.clone(), &query))
        })
        .await?;

        Ok(ListPage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_cursor: response.next_page_token,
        })
    }

    async fn fetch_metadata(
        &self,
        id: &str,
        deadline: &Deadline,
    ) -> Result<MessageMeta, DriverError> {
        let url = format!("{}/users/me/messages/{id}", self.base_url);
        let mut query: Vec<(&str, String)> = vec![("format", "metadata".to_string())];
        for header in METADATA_HEADERS {
            query.push(("metadataHeaders", header.to_string()));
        }

        let response: MessageResponse = with_retries("gmail metadata", deadline, || {
            timed(self.timeouts.meta, deadline, self.get_json(url.clone(), &query))
        })
        .await?;

        Ok(meta_from_response(&response))
    }

    async fn fetch_full(&self, id: &str, deadline: &Deadline) -> Result<FullMessage, DriverError> {
        let url = format!("{}/users/me/messages/{id}", self.base_url);
        let query: Vec<(&str, String)> = vec![("format", "full".to_string())];

        let response: MessageResponse = with_retries("gmail full", deadline, || {
            timed(self.timeouts.full, deadline, self.get_json(url.clone(), &query))
        })
        .await?;

        let meta = meta_from_response(&response);
        let mut bodies = MessageBodies::default();
        let mut pending: Vec<(String, String)> = Vec::new();
        if let Some(payload) = response.payload.as_ref() {
            collect_bodies(payload, &mut bodies, &mut pending);
        }

        // Externalized small body parts come in through the attachment
        // endpoint; failures here degrade to whatever inline bodies we got.
        for (mime_type, attachment_id) in pending {
            if deadline.should_stop() {
                break;
            }
            match self.fetch_attachment(&meta.id, &attachment_id, deadline).await {
                Ok(Some(content)) => {
                    if mime_type.eq_ignore_ascii_case("text/plain") {
                        bodies.text.push_str(&content);
                    } else {
                        bodies.html.push_str(&content);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!("gmail attachment {attachment_id} skipped: {err}");
                }
            }
        }

        Ok(FullMessage { meta, bodies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::options::QueryMode;

    #[test]
    fn test_transactional_query() {
        let query = build_query(90, QueryMode::Transactions, false);
        assert!(query.contains("in:anywhere"));
        assert!(query.contains("newer_than:90d"));
        assert!(query.contains("-category:promotions"));
        assert!(query.contains("-category:social"));
        assert!(query.contains("receipt OR invoice"));
    }

    #[test]
    fn test_broad_query_respects_promotions_flag() {
        let without = build_query(30, QueryMode::Broad, false);
        assert!(without.contains("-in:chats"));
        assert!(without.contains("-category:promotions"));

        let with = build_query(30, QueryMode::Broad, true);
        assert!(with.contains("-in:chats"));
        assert!(!with.contains("-category:promotions"));
    }

    #[test]
    fn test_meta_from_response_headers_and_date() {
        let response: MessageResponse = serde_json::from_value(serde_json::json!({
            "id": "abc123",
            "snippet": "You were charged $15.49",
            "internalDate": "1762905600000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "Netflix <info@account.netflix.com>"},
                    {"name": "Subject", "value": "Your Netflix billing"},
                    {"name": "List-Unsubscribe", "value": "<https://netflix.com/unsub>"}
                ]
            }
        }))
        .unwrap();

        let meta = meta_from_response(&response);
        assert_eq!(meta.id, "abc123");
        assert_eq!(meta.from, "Netflix <info@account.netflix.com>");
        assert_eq!(meta.subject, "Your Netflix billing");
        assert_eq!(meta.date_ms, Some(1_762_905_600_000));
        assert!(meta.list_unsubscribe.is_some());
        assert!(meta.precedence.is_none());
    }

    #[test]
    fn test_collect_bodies_decodes_parts() {
        let encoded_text = URL_SAFE_NO_PAD.encode("You were charged $15.49");
        let encoded_html = URL_SAFE_NO_PAD.encode("<b>charged</b>");
        let payload: Payload = serde_json::from_value(serde_json::json!({
            "mimeType": "multipart/alternative",
            "parts": [
                {"mimeType": "text/plain", "body": {"size": 23, "data": encoded_text}},
                {"mimeType": "text/html", "body": {"size": 14, "data": encoded_html}},
                {"mimeType": "text/plain", "body": {"size": 500_000, "attachmentId": "big"}}
            ]
        }))
        .unwrap();

        let mut bodies = MessageBodies::default();
        let mut pending = Vec::new();
        collect_bodies(&payload, &mut bodies, &mut pending);

        assert_eq!(bodies.text, "You were charged $15.49");
        assert_eq!(bodies.html, "<b>charged</b>");
        // Oversized externalized part is not scheduled for fetch.
        assert!(pending.is_empty());
    }

    #[test]
    fn test_collect_bodies_schedules_small_attachment() {
        let payload: Payload = serde_json::from_value(serde_json::json!({
            "mimeType": "text/plain",
            "body": {"size": 1024, "attachmentId": "small"}
        }))
        .unwrap();

        let mut bodies = MessageBodies::default();
        let mut pending = Vec::new();
        collect_bodies(&payload, &mut bodies, &mut pending);
        assert_eq!(pending, vec![("text/plain".to_string(), "small".to_string())]);
    }
}
