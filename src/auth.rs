//! Constant-time API-key `axum` middleware guarding every route except
//! `/health`. Adapted from the teacher's `auth.rs`, which compares the
//! `Authorization` header against a configured key via `subtle` to avoid a
//! timing side channel.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use subtle::ConstantTimeEq;

const AUTH_HEADER: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

/// 384 bits of entropy over a base62 alphabet, enough to seed `FLEET_API_KEY`
/// for a fresh deployment. `thread_rng` draws from OS entropy, not a PRNG
/// seeded from wall-clock time.
const API_KEY_LENGTH: usize = 64;

pub fn generate_api_key() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// No-op when `FLEET_API_KEY` is unset, matching the teacher's dev-mode
/// bypass for local runs without a configured key.
pub async fn auth_middleware(
    State(config): State<std::sync::Arc<ApiConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &config.api_key else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX));

    match provided {
        Some(token) if constant_time_eq(token, expected) => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("short", "muchlongerkey"));
    }

    #[test]
    fn constant_time_eq_accepts_identical_keys() {
        assert!(constant_time_eq("a-valid-key-123456789012345678", "a-valid-key-123456789012345678"));
    }
}
