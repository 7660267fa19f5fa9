//! Request logging tuned for the scan API.
//!
//! One line per request with timing, tagged with the scan session the URL
//! names (the `sessionId` query pair, or the trailing diagnostics path
//! segment) so a session's HTTP traffic can be grepped alongside its
//! dispatcher log lines. Requests slower than a second escalate to `warn`.

use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// Above this, the request is logged at warn level.
const SLOW_REQUEST_MS: f64 = 1_000.0;

pub struct RequestLogger;

/// Scan session named by the request URL, if any.
fn session_tag(request: &Request<'_>) -> Option<String> {
    if let Some(query) = request.uri().query() {
        if let Some((_, value)) = query.segments().find(|(key, _)| *key == "sessionId") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    let path = request.uri().path();
    if path.as_str().starts_with("/v1/gmail/scan/diagnostics/") {
        return path.segments().last().map(str::to_string);
    }
    None
}

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let started = request.local_cache(Instant::now);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let session = session_tag(request)
            .map(|id| format!(" session={id}"))
            .unwrap_or_default();
        let status = response.status().code;

        if elapsed_ms > SLOW_REQUEST_MS {
            log::warn!(
                "slow request: {} {}{session} status={status} took={elapsed_ms:.1}ms",
                request.method(),
                request.uri().path(),
            );
        } else {
            log::info!(
                "{} {}{session} status={status} took={elapsed_ms:.1}ms",
                request.method(),
                request.uri().path(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::local::blocking::Client;

    fn client() -> Client {
        Client::untracked(rocket::build()).expect("bare rocket builds")
    }

    #[test]
    fn test_session_tag_from_query() {
        let client = client();
        let request = client.get("/v1/gmail/scan/status?sessionId=abc-123");
        assert_eq!(session_tag(request.inner()), Some("abc-123".to_string()));

        let request = client.get("/v1/gmail/scan/status?sessionId=");
        assert_eq!(session_tag(request.inner()), None);
    }

    #[test]
    fn test_session_tag_from_diagnostics_path() {
        let client = client();
        let request = client.get("/v1/gmail/scan/diagnostics/sess-9");
        assert_eq!(session_tag(request.inner()), Some("sess-9".to_string()));
    }

    #[test]
    fn test_untagged_request() {
        let client = client();
        let request = client.get("/health");
        assert_eq!(session_tag(request.inner()), None);
    }
}
