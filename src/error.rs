//! API error type and its wire envelopes.
//!
//! Every handler returns `Result<_, ApiError>`; the responder renders the
//! envelope the client contract expects: `{"error": "bad_request", ...}`
//! with the matching status code. Database errors are logged server-side and
//! surface as opaque internal errors.

use crate::scan::error::ScanErrorCode;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use rocket_okapi::OpenApiError;
use rocket_okapi::okapi::openapi3::Responses;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::response::OpenApiResponderInner;
use serde_json::json;
use std::io::Cursor;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    MissingBearerToken,
    InvalidToken,
    NotFound,
    QueueUnavailable(ScanErrorCode),
    Database(sqlx::Error),
    Internal(String),
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, body) = match self {
            ApiError::BadRequest(details) => {
                log::debug!("bad request: {details}");
                (
                    Status::BadRequest,
                    json!({ "error": "bad_request", "details": details }),
                )
            }
            ApiError::MissingBearerToken => (
                Status::Unauthorized,
                json!({ "error": "missing_bearer_token" }),
            ),
            ApiError::InvalidToken => {
                (Status::Unauthorized, json!({ "error": "invalid_token" }))
            }
            ApiError::NotFound => (Status::NotFound, json!({ "error": "not_found" })),
            ApiError::QueueUnavailable(code) => {
                log::error!("queue unavailable: {code}");
                (
                    Status::ServiceUnavailable,
                    json!({ "error": "queue_unavailable", "code": code.as_str() }),
                )
            }
            ApiError::Database(err) => {
                log::error!("database error: {err}");
                (
                    Status::InternalServerError,
                    json!({ "error": "internal_error" }),
                )
            }
            ApiError::Internal(msg) => {
                log::error!("internal error: {msg}");
                (
                    Status::InternalServerError,
                    json!({ "error": "internal_error" }),
                )
            }
        };

        let body = body.to_string();
        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err),
        }
    }
}

impl OpenApiResponderInner for ApiError {
    fn responses(_generator: &mut OpenApiGenerator) -> Result<Responses, OpenApiError> {
        use rocket_okapi::okapi::openapi3::*;

        Ok(Responses {
            responses: rocket_okapi::okapi::map! {
                "400".to_string() => RefOr::Object(Response {
                    description: "Bad Request - validation failed".to_string(),
                    ..Default::default()
                }),
                "401".to_string() => RefOr::Object(Response {
                    description: "Unauthorized - missing or invalid bearer token".to_string(),
                    ..Default::default()
                }),
                "404".to_string() => RefOr::Object(Response {
                    description: "Not Found".to_string(),
                    ..Default::default()
                }),
                "503".to_string() => RefOr::Object(Response {
                    description: "Service Unavailable - job queue unreachable".to_string(),
                    ..Default::default()
                }),
                "500".to_string() => RefOr::Object(Response {
                    description: "Internal Server Error".to_string(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        })
    }
}
