//! Closed error-code set for session failures. Codes are stored on the
//! session row and surfaced in `error` SSE events.

use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanErrorCode {
    MissingToken,
    TokenBootstrapFailed,
    SessionCreateFailed,
    QueueEnqueueFailed,
    UnsupportedProvider,
    ChunkError,
    Deadline,
    GmailListFailed,
    AuthFailed,
    NeedsAppPassword,
    NetworkError,
    Unknown,
}

impl ScanErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanErrorCode::MissingToken => "MISSING_TOKEN",
            ScanErrorCode::TokenBootstrapFailed => "TOKEN_BOOTSTRAP_FAILED",
            ScanErrorCode::SessionCreateFailed => "SESSION_CREATE_FAILED",
            ScanErrorCode::QueueEnqueueFailed => "QUEUE_ENQUEUE_FAILED",
            ScanErrorCode::UnsupportedProvider => "UNSUPPORTED_PROVIDER",
            ScanErrorCode::ChunkError => "CHUNK_ERROR",
            ScanErrorCode::Deadline => "DEADLINE",
            ScanErrorCode::GmailListFailed => "GMAIL_LIST_FAILED",
            ScanErrorCode::AuthFailed => "AUTH_FAILED",
            ScanErrorCode::NeedsAppPassword => "NEEDS_APP_PASSWORD",
            ScanErrorCode::NetworkError => "NETWORK_ERROR",
            ScanErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ScanErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_wire_codes() {
        let json = serde_json::to_string(&ScanErrorCode::MissingToken).unwrap();
        assert_eq!(json, "\"MISSING_TOKEN\"");
        let parsed: ScanErrorCode = serde_json::from_str("\"GMAIL_LIST_FAILED\"").unwrap();
        assert_eq!(parsed, ScanErrorCode::GmailListFailed);
        assert_eq!(parsed.as_str(), "GMAIL_LIST_FAILED");
    }
}
