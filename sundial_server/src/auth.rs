use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use std::future;
use std::sync::Arc;
use sundial_core::webhooks::constant_time_eq;

/// Proof that the caller holds the cron secret (`Authorization: Bearer <secret>`).
///
/// With no secret configured every request is rejected.
#[derive(Debug, Copy, Clone)]
pub struct CronAuth;

/// Hash both sides so the comparison length never depends on the guess.
pub fn cron_token_matches(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    constant_time_eq(&a, &b)
}

impl<S> FromRequestParts<S> for CronAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.cron_auth", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = (|| {
            let state = parts
                .extensions
                .get::<Arc<AppState>>()
                .ok_or(ApiError::Unauthorized)?;
            let expected = state.cron_secret.as_deref().ok_or_else(|| {
                tracing::warn!("cron endpoint called but no cron secret is configured");
                ApiError::Unauthorized
            })?;
            let header = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;
            let token = header
                .strip_prefix("Bearer ")
                .or_else(|| header.strip_prefix("bearer "))
                .ok_or(ApiError::Unauthorized)?
                .trim();
            if cron_token_matches(expected, token) {
                Ok(CronAuth)
            } else {
                Err(ApiError::Unauthorized)
            }
        })();
        future::ready(res)
    }
}
