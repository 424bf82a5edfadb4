//! Shared HTTP plumbing: client construction and vendor status mapping.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use sundial_core::AdapterError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn client(timeout: Duration) -> Result<Client, AdapterError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("sundial/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AdapterError::Unknown(format!("http client: {e}")))
}

pub fn transport(provider: &str, e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Unknown(format!("{provider} request timed out"))
    } else {
        AdapterError::Unknown(format!("{provider} request failed: {e}"))
    }
}

/// Map a non-success status onto the adapter error taxonomy.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> AdapterError {
    let detail = truncate(body, 300);
    match status {
        StatusCode::UNAUTHORIZED => AdapterError::AuthExpired(format!("{provider}: {detail}")),
        StatusCode::FORBIDDEN => AdapterError::ScopeMissing(format!("{provider}: {detail}")),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited {
            retry_after,
            message: format!("{provider}: {detail}"),
        },
        s => AdapterError::Unknown(format!("{provider} returned {s}: {detail}")),
    }
}

/// Pass successful responses through; turn everything else into an `AdapterError`.
pub async fn check(provider: &str, resp: Response) -> Result<Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(provider, status, retry_after, &body))
}

pub async fn json<T: serde::de::DeserializeOwned>(
    provider: &str,
    resp: Response,
) -> Result<T, AdapterError> {
    let resp = check(provider, resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| AdapterError::Unknown(format!("{provider} response decode: {e}")))
}

/// Only the delta-seconds form; HTTP dates are rare from these vendors.
pub fn parse_retry_after(v: &str) -> Option<Duration> {
    v.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// `access_token` from a stored secret blob.
pub fn access_token(provider: &str, secret: &serde_json::Value) -> Result<String, AdapterError> {
    secret
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AdapterError::AuthExpired(format!("{provider} secret has no access_token")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_taxonomy() {
        assert!(matches!(
            classify_status("x", StatusCode::UNAUTHORIZED, None, ""),
            AdapterError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status("x", StatusCode::FORBIDDEN, None, ""),
            AdapterError::ScopeMissing(_)
        ));
        assert_eq!(
            classify_status("x", StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "slow"),
            AdapterError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
                message: "x: slow".to_string()
            }
        );
        assert!(matches!(
            classify_status("x", StatusCode::BAD_GATEWAY, None, ""),
            AdapterError::Unknown(_)
        ));
    }

    #[test]
    fn retry_after_and_token_helpers() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(
            access_token("x", &serde_json::json!({"access_token": "abc"})).unwrap(),
            "abc"
        );
        assert!(matches!(
            access_token("x", &serde_json::json!({})),
            Err(AdapterError::AuthExpired(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
