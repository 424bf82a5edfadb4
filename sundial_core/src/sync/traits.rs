use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::NormalizedItem;
use crate::webhooks::VerifiedEvent;
use crate::{Error, Result};

/// Structured failure every adapter surfaces instead of vendor errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    #[error("missing scope: {0}")]
    ScopeMissing(String),

    #[error("rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("provider error: {0}")]
    Unknown(String),
}

/// One record as the provider returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRawItem {
    pub source_id: String,
    pub payload: serde_json::Value,
}

impl ProviderRawItem {
    #[tracing::instrument(level = "debug", skip(payload))]
    pub fn new(
        source_id: impl Into<String> + std::fmt::Debug,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let source_id = source_id.into();
        if source_id.trim().is_empty() {
            return Err(Error::InvalidInput("raw item source_id is empty".to_string()));
        }
        Ok(Self { source_id, payload })
    }
}

/// Output of one `fetch_changes` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub items: Vec<ProviderRawItem>,
    /// Source ids the provider reports as deleted since the cursor.
    pub removed: Vec<String>,
    pub next_cursor: Option<String>,
    /// Set when the adapter refreshed its tokens during the call.
    pub rotated_secret: Option<serde_json::Value>,
}

/// Routing facts read from an unverified webhook body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebhookDescriptor {
    pub event_name: String,
    /// Provider-side account the delivery is about.
    pub account_id: Option<String>,
}

/// What a verified webhook asks the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookDelta {
    /// The delivery carries the changed records.
    Upsert(Vec<ProviderRawItem>),
    Remove(Vec<String>),
    /// Changes exist but must be fetched.
    Resync,
    Ignore,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokePolicy {
    /// Local delete wins; a failed remote revoke is reported, not fatal.
    BestEffort,
    /// The provider must confirm revocation before the credential is dropped.
    MustSucceed,
}

/// A provider integration: fetch-since, normalize, and webhook interpretation.
///
/// Implementations live in `sundial_integrations` and own their vendor auth
/// refresh logic.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name; also the credential key.
    fn provider(&self) -> &'static str;

    async fn fetch_changes(
        &self,
        secret: &serde_json::Value,
        cursor: Option<&str>,
    ) -> std::result::Result<FetchResult, AdapterError>;

    fn normalize(&self, raw: &ProviderRawItem) -> std::result::Result<NormalizedItem, AdapterError>;

    fn describe_webhook(&self, payload: &serde_json::Value) -> WebhookDescriptor {
        WebhookDescriptor {
            event_name: payload
                .get("event_name")
                .or_else(|| payload.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            account_id: None,
        }
    }

    fn interpret_webhook(
        &self,
        _event: &VerifiedEvent,
    ) -> std::result::Result<WebhookDelta, AdapterError> {
        Ok(WebhookDelta::Ignore)
    }

    fn revoke_policy(&self) -> RevokePolicy {
        RevokePolicy::BestEffort
    }

    async fn revoke(&self, _secret: &serde_json::Value) -> std::result::Result<(), AdapterError> {
        Ok(())
    }
}
