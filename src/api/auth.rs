// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// The expected token is `MARKWATCH_ADMIN_TOKEN`, loaded once at startup into
// `AppState`. Comparison is constant time.
//
//   async fn handler(_auth: AuthBearer, State(state): State<Arc<AppState>>)
//
// A missing or wrong token short-circuits with 401 before the handler runs;
// an unconfigured server answers 403 to everything protected.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time for equal lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check `presented` against `expected`. An empty `expected` never matches.
pub fn validate_token(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

pub struct AuthBearer;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        if state.admin_token.is_empty() {
            warn!("MARKWATCH_ADMIN_TOKEN is not set; rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "server authentication not configured",
            });
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "missing or malformed authorization header",
            });
        };

        if !validate_token(token, &state.admin_token) {
            warn!(path = %parts.uri.path(), "invalid admin token presented");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "invalid authorization token",
            });
        }
        Ok(AuthBearer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn empty_expected_token_never_validates() {
        assert!(!validate_token("", ""));
        assert!(!validate_token("anything", ""));
        assert!(validate_token("s3cret", "s3cret"));
        assert!(!validate_token("s3cre", "s3cret"));
    }
}
