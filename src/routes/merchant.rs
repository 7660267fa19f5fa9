//! Merchant override endpoint.
//!
//! Confirming a merchant pins a canonical name to a sender email or sender
//! domain for the calling user. The resolver consults these before anything
//! else, so a confirmation immediately reshapes future scans.

use crate::auth::BearerUser;
use crate::detect::normalize::{email_address, email_domain};
use crate::error::ApiError;
use crate::store::directory;
use rocket::State;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx::PgPool;
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub canonical_name: String,
    /// Raw `From` header; the address inside decides the axis.
    pub from: Option<String>,
    pub sender_email: Option<String>,
    pub sender_domain: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub ok: bool,
    pub canonical_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_domain: Option<String>,
}

#[openapi(tag = "Merchant")]
#[post("/v1/merchant/confirm", data = "<request>")]
pub async fn confirm_merchant(
    user: BearerUser,
    pool: &State<PgPool>,
    request: Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let request = request.into_inner();
    let canonical_name = request.canonical_name.trim().to_string();
    if canonical_name.is_empty() {
        return Err(ApiError::BadRequest("canonicalName is required".to_string()));
    }

    // Precedence: explicit senderEmail, explicit senderDomain, then the
    // address found inside a raw From header.
    let (sender_email, sender_domain) = if let Some(email) = request
        .sender_email
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        (Some(email.to_lowercase()), None)
    } else if let Some(domain) = request
        .sender_domain
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        (None, Some(domain.to_lowercase()))
    } else if let Some(from) = request.from.as_deref() {
        match (email_address(from), email_domain(from)) {
            (Some(email), _) => (Some(email), None),
            (None, Some(domain)) => (None, Some(domain)),
            _ => {
                return Err(ApiError::BadRequest(
                    "from did not contain an address or domain".to_string(),
                ));
            }
        }
    } else {
        return Err(ApiError::BadRequest(
            "one of from, senderEmail, senderDomain is required".to_string(),
        ));
    };

    if let Some(email) = sender_email.as_deref() {
        directory::upsert_email_override(pool.inner(), &user.user_id, email, &canonical_name)
            .await?;
    }
    if let Some(domain) = sender_domain.as_deref() {
        directory::upsert_domain_override(pool.inner(), &user.user_id, domain, &canonical_name)
            .await?;
    }

    log::info!(
        "user {}: merchant override -> {canonical_name}",
        user.user_id
    );
    Ok(Json(ConfirmResponse {
        ok: true,
        canonical_name,
        sender_email,
        sender_domain,
    }))
}
