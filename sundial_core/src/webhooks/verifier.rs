use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::jwt::{KeyFetcher, verify_signed_claims};
use super::key_cache::KeyCache;
use super::signature::verify_hmac_sha256;
use super::{VerificationError, VerifiedEvent, WebhookEvent};

pub const DEFAULT_MAX_TOKEN_AGE: Duration = Duration::from_secs(5 * 60);

/// How one provider proves its deliveries.
#[derive(Clone)]
pub enum VerificationMode {
    Hmac {
        secret: String,
        header: String,
    },
    SignedClaims {
        header: String,
        fetcher: Arc<dyn KeyFetcher>,
        max_token_age: Duration,
    },
}

impl VerificationMode {
    pub fn header(&self) -> &str {
        match self {
            VerificationMode::Hmac { header, .. } => header,
            VerificationMode::SignedClaims { header, .. } => header,
        }
    }
}

impl std::fmt::Debug for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMode::Hmac { header, .. } => {
                f.debug_struct("Hmac").field("header", header).finish_non_exhaustive()
            }
            VerificationMode::SignedClaims {
                header,
                max_token_age,
                ..
            } => f
                .debug_struct("SignedClaims")
                .field("header", header)
                .field("max_token_age", max_token_age)
                .finish_non_exhaustive(),
        }
    }
}

/// Per-provider verification with an injected key cache.
#[derive(Clone, Debug)]
pub struct WebhookVerifier {
    modes: HashMap<String, VerificationMode>,
    key_cache: Arc<KeyCache>,
}

impl WebhookVerifier {
    pub fn new(key_cache: Arc<KeyCache>) -> Self {
        Self {
            modes: HashMap::new(),
            key_cache,
        }
    }

    pub fn with_mode(mut self, provider: impl Into<String>, mode: VerificationMode) -> Self {
        self.modes.insert(provider.into(), mode);
        self
    }

    pub fn with_hmac(
        self,
        provider: impl Into<String>,
        secret: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        self.with_mode(
            provider,
            VerificationMode::Hmac {
                secret: secret.into(),
                header: header.into(),
            },
        )
    }

    pub fn with_signed_claims(
        self,
        provider: impl Into<String>,
        header: impl Into<String>,
        fetcher: Arc<dyn KeyFetcher>,
    ) -> Self {
        self.with_mode(
            provider,
            VerificationMode::SignedClaims {
                header: header.into(),
                fetcher,
                max_token_age: DEFAULT_MAX_TOKEN_AGE,
            },
        )
    }

    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.key_cache
    }

    pub fn knows(&self, provider: &str) -> bool {
        self.modes.contains_key(provider)
    }

    /// Pull the provider's signature header, if the provider is configured.
    pub fn claimed_signature(&self, provider: &str, headers: &HeaderMap) -> Option<String> {
        let mode = self.modes.get(provider)?;
        headers
            .get(mode.header())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub async fn verify(&self, event: &WebhookEvent) -> Result<VerifiedEvent, VerificationError> {
        self.verify_at(event, Utc::now()).await
    }

    #[tracing::instrument(level = "debug", skip(self, event), fields(provider = %event.provider, event_name = %event.event_name))]
    pub async fn verify_at(
        &self,
        event: &WebhookEvent,
        now: DateTime<Utc>,
    ) -> Result<VerifiedEvent, VerificationError> {
        let mode = self
            .modes
            .get(&event.provider)
            .ok_or_else(|| VerificationError::UnknownProvider(event.provider.clone()))?;

        let key_id = match mode {
            VerificationMode::Hmac { secret, .. } => {
                verify_hmac_sha256(
                    secret.as_bytes(),
                    &event.raw_body,
                    event.claimed_signature.as_deref(),
                )?;
                None
            }
            VerificationMode::SignedClaims {
                fetcher,
                max_token_age,
                ..
            } => {
                let token = verify_signed_claims(
                    &event.provider,
                    event.claimed_signature.as_deref(),
                    &event.raw_body,
                    fetcher.as_ref(),
                    &self.key_cache,
                    *max_token_age,
                    now,
                )
                .await?;
                Some(token.kid)
            }
        };

        Ok(VerifiedEvent {
            provider: event.provider.clone(),
            event_name: event.event_name.clone(),
            payload: event.parsed_payload.clone(),
            verified_at: now,
            key_id,
        })
    }
}
