//! Caller authentication: a bearer JWT carrying the user subject.
//!
//! The guard validates an HS256 token signed with `AUTH_JWT_SECRET` and
//! exposes its `sub` claim as the user id. Nothing else about the caller is
//! trusted; sessions, candidates, and events are all scoped by this subject.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket_okapi::OpenApiError;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Authenticated caller. Request guard over the `Authorization` header.
#[derive(Debug, Clone)]
pub struct BearerUser {
    pub user_id: String,
}

/// Which 401 envelope the error catcher should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingBearerToken,
    InvalidToken,
}

fn decode_bearer(token: &str) -> Option<String> {
    let secret = std::env::var("AUTH_JWT_SECRET").ok()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()
    .map(|data| data.claims.sub)
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerUser {
    type Error = AuthRejection;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(header) = request.headers().get_one("Authorization") else {
            request.local_cache(|| Some(AuthRejection::MissingBearerToken));
            return Outcome::Error((Status::Unauthorized, AuthRejection::MissingBearerToken));
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            request.local_cache(|| Some(AuthRejection::MissingBearerToken));
            return Outcome::Error((Status::Unauthorized, AuthRejection::MissingBearerToken));
        };
        match decode_bearer(token.trim()) {
            Some(user_id) => Outcome::Success(BearerUser { user_id }),
            None => {
                request.local_cache(|| Some(AuthRejection::InvalidToken));
                Outcome::Error((Status::Unauthorized, AuthRejection::InvalidToken))
            }
        }
    }
}

impl<'r> OpenApiFromRequest<'r> for BearerUser {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> Result<RequestHeaderInput, OpenApiError> {
        Ok(RequestHeaderInput::None)
    }
}

/// 401 catcher rendering the contract envelopes.
#[rocket::catch(401)]
pub fn unauthorized(request: &Request<'_>) -> rocket::serde::json::Value {
    let rejection = request
        .local_cache(|| None::<AuthRejection>)
        .unwrap_or(AuthRejection::MissingBearerToken);
    match rejection {
        AuthRejection::MissingBearerToken => {
            rocket::serde::json::json!({ "error": "missing_bearer_token" })
        }
        AuthRejection::InvalidToken => rocket::serde::json::json!({ "error": "invalid_token" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token_for(sub: &str, secret: &str, exp: usize) -> String {
        #[derive(serde::Serialize)]
        struct OutClaims<'a> {
            sub: &'a str,
            exp: usize,
        }
        encode(
            &Header::new(Algorithm::HS256),
            &OutClaims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_decode_roundtrip() {
        // Safety: test-only env mutation, single-threaded access.
        unsafe { std::env::set_var("AUTH_JWT_SECRET", "test-secret") };
        let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
        let token = token_for("user-1", "test-secret", exp);
        assert_eq!(decode_bearer(&token).as_deref(), Some("user-1"));

        let wrong = token_for("user-1", "other-secret", exp);
        assert_eq!(decode_bearer(&wrong), None);
    }
}
