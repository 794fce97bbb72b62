// =============================================================================
// Bearer Token Authentication — Axum Middleware
// =============================================================================
//
// Guards the admin surface (risk-limit edits, mode switches, manual kill) with
// a single shared secret read from `SENTINEL_ADMIN_TOKEN`. Two entry points
// share one comparison path: the `AuthBearer` extractor for ordinary HTTP
// handlers, and `validate_token` for the WebSocket upgrade where the token
// arrives as a query parameter instead of a header.
// =============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const ADMIN_TOKEN_ENV: &str = "SENTINEL_ADMIN_TOKEN";

/// Compare two byte slices in constant time. A length mismatch returns early —
/// the expected token's length is not a secret — but once lengths match every
/// byte is examined regardless of where the first difference falls.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check `candidate` against the configured admin token. `Ok(false)` if no
/// token is configured at all (treated as "reject everything" by callers,
/// but distinguished here so each call site can log its own context).
fn check_token(candidate: &str) -> bool {
    match std::env::var(ADMIN_TOKEN_ENV) {
        Ok(expected) if !expected.is_empty() => constant_time_eq(candidate.as_bytes(), expected.as_bytes()),
        _ => false,
    }
}

/// Validate a token string against the configured admin token. Used where the
/// `AuthBearer` extractor doesn't apply, e.g. a WebSocket upgrade that passes
/// the token as a query parameter.
pub fn validate_token(token: &str) -> bool {
    check_token(token)
}

/// Axum extractor that pulls a `Bearer` token out of the `Authorization`
/// header and validates it via [`check_token`]. Yields the raw token string
/// on success (useful for audit logging); short-circuits with 403 otherwise.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl AuthRejection {
    fn forbidden(message: &'static str) -> Self {
        Self { status: StatusCode::FORBIDDEN, message }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, axum::Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(parts) else {
            warn!("request missing Bearer token");
            return Err(AuthRejection::forbidden("missing or invalid authorization token"));
        };

        if !check_token(token) {
            warn!("request presented an invalid or unconfigured admin token");
            return Err(AuthRejection::forbidden("invalid authorization token"));
        }

        Ok(AuthBearer(token.to_string()))
    }
}
