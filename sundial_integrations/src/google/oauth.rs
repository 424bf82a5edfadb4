//! Google OAuth token refresh and revocation shared by Calendar and Gmail.

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sundial_core::AdapterError;

use crate::http;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";
/// Refresh this long before the recorded expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Stored secret shape for Google providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GoogleTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - Duration::seconds(EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone)]
pub struct GoogleOAuth {
    client: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    revoke_url: String,
}

impl GoogleOAuth {
    pub fn new(
        client: Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: TOKEN_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }

    pub fn parse_secret(provider: &str, secret: &serde_json::Value) -> Result<GoogleTokens, AdapterError> {
        serde_json::from_value(secret.clone())
            .map_err(|e| AdapterError::AuthExpired(format!("{provider} secret unreadable: {e}")))
    }

    /// Returns usable tokens plus the secret to persist when a refresh happened.
    #[tracing::instrument(level = "debug", skip(self, secret))]
    pub async fn ensure_fresh(
        &self,
        provider: &str,
        secret: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(GoogleTokens, Option<serde_json::Value>), AdapterError> {
        let tokens = Self::parse_secret(provider, secret)?;
        if !tokens.needs_refresh(now) {
            return Ok((tokens, None));
        }
        let refreshed = self.refresh(provider, &tokens, now).await?;
        let value = serde_json::to_value(&refreshed)
            .map_err(|e| AdapterError::Unknown(format!("encode refreshed tokens: {e}")))?;
        Ok((refreshed, Some(value)))
    }

    pub async fn refresh(
        &self,
        provider: &str,
        tokens: &GoogleTokens,
        now: DateTime<Utc>,
    ) -> Result<GoogleTokens, AdapterError> {
        let refresh_token = tokens.refresh_token.as_deref().ok_or_else(|| {
            AdapterError::AuthExpired(format!("{provider} access token expired and no refresh token"))
        })?;
        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| http::transport(provider, e))?;

        if resp.status() == StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            return Err(refresh_rejection(provider, &body));
        }
        let body: TokenResponse = http::json(provider, resp).await?;
        Ok(merge_refresh(tokens, body, now))
    }

    #[tracing::instrument(level = "info", skip(self, secret))]
    pub async fn revoke(&self, provider: &str, secret: &serde_json::Value) -> Result<(), AdapterError> {
        let tokens = Self::parse_secret(provider, secret)?;
        // Revoking the refresh token also kills every access token minted from it.
        let token = tokens.refresh_token.unwrap_or(tokens.access_token);
        let resp = self
            .client
            .post(&self.revoke_url)
            .form(&[("token", token.as_str())])
            .send()
            .await
            .map_err(|e| http::transport(provider, e))?;
        http::check(provider, resp).await?;
        Ok(())
    }
}

fn merge_refresh(old: &GoogleTokens, resp: TokenResponse, now: DateTime<Utc>) -> GoogleTokens {
    GoogleTokens {
        access_token: resp.access_token,
        // Google only returns a new refresh token when it rotates one.
        refresh_token: resp.refresh_token.or_else(|| old.refresh_token.clone()),
        expires_at: resp.expires_in.map(|s| now + Duration::seconds(s)),
    }
}

fn refresh_rejection(provider: &str, body: &str) -> AdapterError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(e) if e.error == "invalid_grant" => AdapterError::AuthExpired(format!(
            "{provider} refresh token revoked: {}",
            e.error_description.unwrap_or_default()
        )),
        Ok(e) if e.error == "invalid_scope" => AdapterError::ScopeMissing(format!("{provider}: {}", e.error)),
        Ok(e) => AdapterError::Unknown(format!("{provider} token refresh: {}", e.error)),
        Err(_) => AdapterError::Unknown(format!("{provider} token refresh rejected")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap()
    }

    #[test]
    fn refresh_window() {
        let mut t = GoogleTokens {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(now() + Duration::seconds(30)),
        };
        assert!(t.needs_refresh(now()));
        t.expires_at = Some(now() + Duration::minutes(10));
        assert!(!t.needs_refresh(now()));
        t.expires_at = None;
        assert!(!t.needs_refresh(now()));
    }

    #[test]
    fn refresh_keeps_old_refresh_token_when_not_rotated() {
        let old = GoogleTokens {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: None,
        };
        let merged = merge_refresh(
            &old,
            TokenResponse {
                access_token: "b".into(),
                expires_in: Some(3600),
                refresh_token: None,
            },
            now(),
        );
        assert_eq!(merged.access_token, "b");
        assert_eq!(merged.refresh_token.as_deref(), Some("r"));
        assert_eq!(merged.expires_at, Some(now() + Duration::hours(1)));
    }

    #[test]
    fn invalid_grant_means_reconnect() {
        assert!(matches!(
            refresh_rejection("gmail", r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#),
            AdapterError::AuthExpired(_)
        ));
        assert!(matches!(
            refresh_rejection("gmail", "<html>"),
            AdapterError::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails_without_network() {
        let oauth = GoogleOAuth::new(Client::new(), "id", "secret");
        let secret = serde_json::json!({
            "access_token": "a",
            "expires_at": "2026-03-02T09:00:00Z"
        });
        let err = oauth.ensure_fresh("gmail", &secret, now()).await.unwrap_err();
        assert!(matches!(err, AdapterError::AuthExpired(_)));

        let fresh = serde_json::json!({"access_token": "a"});
        let (tokens, rotated) = oauth.ensure_fresh("gmail", &fresh, now()).await.unwrap();
        assert_eq!(tokens.access_token, "a");
        assert!(rotated.is_none());
    }
}
