use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::{VerificationError, WebhookEvent, WebhookVerifier};
use crate::models::UserId;
use crate::ratelimit::{RateLimitExceeded, RateLimiter};
use crate::sync::{AdapterOutcome, SyncEngine};
use crate::triage::TriageOutcome;

/// Why a delivery was dropped. Logged, never returned to the sender.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("malformed webhook body: {0}")]
    Malformed(String),

    #[error("no adapter registered for '{0}'")]
    UnknownProvider(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("adapter could not interpret delivery: {0}")]
    Interpret(String),

    #[error(transparent)]
    Storage(#[from] crate::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied {
        user_id: UserId,
        sync: AdapterOutcome,
        triage: TriageOutcome,
    },
    /// Verified, but the event carries nothing the pipeline acts on.
    Ignored { event_name: String },
    /// Verified, but no local user has linked the remote account.
    UnknownOwner { account_id: Option<String> },
}

/// Verified webhook deliveries into the sync path.
#[derive(Clone)]
pub struct WebhookIngestor {
    verifier: Arc<WebhookVerifier>,
    engine: SyncEngine,
    limiter: RateLimiter,
}

impl WebhookIngestor {
    pub fn new(verifier: Arc<WebhookVerifier>, engine: SyncEngine, limiter: RateLimiter) -> Self {
        Self {
            verifier,
            engine,
            limiter,
        }
    }

    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest_at(provider, headers, body, Utc::now()).await
    }

    #[tracing::instrument(level = "info", skip(self, headers, body, now), fields(bytes = body.len()))]
    pub async fn ingest_at(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| IngestError::Malformed(e.to_string()))?;

        let adapter = self
            .engine
            .adapter(provider)
            .await
            .map_err(|_| IngestError::UnknownProvider(provider.to_string()))?;
        let descriptor = adapter.describe_webhook(&payload);

        let identity = format!(
            "{provider}:{}",
            descriptor.account_id.as_deref().unwrap_or("unknown")
        );
        self.limiter.check_at(&identity, now).await?;

        let event = WebhookEvent {
            provider: provider.to_string(),
            event_name: descriptor.event_name.clone(),
            claimed_signature: self.verifier.claimed_signature(provider, headers),
            raw_body: body.to_vec(),
            parsed_payload: payload,
        };
        let verified = self.verifier.verify_at(&event, now).await?;

        let Some(account_id) = descriptor.account_id else {
            return Ok(IngestOutcome::UnknownOwner { account_id: None });
        };
        let Some(user_id) = self
            .engine
            .credentials()
            .find_owner(provider, &account_id)
            .await?
        else {
            tracing::info!(%account_id, "webhook for an unlinked account");
            return Ok(IngestOutcome::UnknownOwner {
                account_id: Some(account_id),
            });
        };

        let delta = adapter
            .interpret_webhook(&verified)
            .map_err(|e| IngestError::Interpret(e.to_string()))?;
        match self.engine.apply_delta(user_id, provider, delta).await? {
            (sync, Some(triage)) => Ok(IngestOutcome::Applied {
                user_id,
                sync,
                triage,
            }),
            (_, None) => Ok(IngestOutcome::Ignored {
                event_name: verified.event_name,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemKind;
    use crate::ratelimit::{MemoryCounterStore, RateLimitPolicy};
    use crate::store::{ItemStore, SqliteStore};
    use crate::sync::SyncConfig;
    use crate::sync::engine::testing::{Script, ScriptedAdapter};
    use crate::triage::TriageEngine;
    use crate::vault::{CredentialManager, CredentialVault};
    use crate::webhooks::KeyCache;
    use crate::webhooks::signature::sign_hmac_sha256_hex;
    use crate::TriageStatus;
    use std::time::Duration;
    use uuid::Uuid;

    const SECRET: &str = "whsec";
    const HEADER: &str = "x-test-signature";

    struct Fixture {
        store: Arc<SqliteStore>,
        ingestor: WebhookIngestor,
        engine: SyncEngine,
        user: UserId,
    }

    async fn fixture(inbound_cap: u64) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let credentials = CredentialManager::new(store.clone(), CredentialVault::from_bytes(&[3u8; 32]).unwrap());
        let counters = Arc::new(MemoryCounterStore::new());
        let engine = SyncEngine::new(
            credentials,
            store.clone(),
            TriageEngine::new(store.clone(), store.clone()),
            RateLimiter::new(RateLimitPolicy::outbound_provider(100, Duration::from_secs(60)), counters.clone()),
            SyncConfig::default(),
        );
        engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![]))))
            .await;
        let user = UserId(Uuid::new_v4());
        engine
            .credentials()
            .store(user, "todoist", &serde_json::json!({"token": "t"}), Some("acct-1"))
            .await
            .unwrap();
        let verifier = WebhookVerifier::new(Arc::new(KeyCache::default())).with_hmac("todoist", SECRET, HEADER);
        let ingestor = WebhookIngestor::new(
            Arc::new(verifier),
            engine.clone(),
            RateLimiter::new(RateLimitPolicy::inbound_webhook(inbound_cap, Duration::from_secs(60)), counters),
        );
        Fixture {
            store,
            ingestor,
            engine,
            user,
        }
    }

    fn signed(body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER, sign_hmac_sha256_hex(SECRET.as_bytes(), body).parse().unwrap());
        headers
    }

    fn delivery(event: &str, id: &str, title: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event_name": event,
            "account": "acct-1",
            "data": {"id": id, "title": title, "updated_at": "2026-03-02T09:00:00Z"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn verified_delivery_lands_in_items_and_queue() {
        let f = fixture(100).await;
        let body = delivery("item:updated", "42", "File taxes");
        let out = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        match out {
            IngestOutcome::Applied { user_id, sync, triage } => {
                assert_eq!(user_id, f.user);
                assert_eq!(sync.items_synced, 1);
                assert_eq!(triage.scored, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let item = f.store.get_item(f.user, "todoist", "42").await.unwrap().unwrap();
        assert_eq!(item.item.title, "File taxes");
    }

    #[tokio::test]
    async fn replayed_delivery_does_not_duplicate_or_reset_decisions() {
        let f = fixture(100).await;
        let body = delivery("item:updated", "42", "File taxes");
        f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();

        let queue = f.engine.triage().list(f.user, None, None).await.unwrap();
        assert_eq!(queue.len(), 1);
        f.engine
            .triage()
            .transition(f.user, queue[0].id, TriageStatus::Dismissed)
            .await
            .unwrap();

        let out = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        let IngestOutcome::Applied { sync, .. } = out else {
            panic!("expected applied");
        };
        assert_eq!(sync.items_synced + sync.items_stale, 1);

        let queue = f.engine.triage().list(f.user, None, None).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, TriageStatus::Dismissed);
        assert_eq!(
            f.store.list_items_by_kind(f.user, ItemKind::Task).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn forged_delivery_is_rejected_before_any_write() {
        let f = fixture(100).await;
        let body = delivery("item:updated", "42", "File taxes");
        let mut headers = signed(b"something else");
        let err = f.ingestor.ingest("todoist", &headers, &body).await.unwrap_err();
        assert!(matches!(err, IngestError::Verification(VerificationError::SignatureMismatch)));

        headers.clear();
        let err = f.ingestor.ingest("todoist", &headers, &body).await.unwrap_err();
        assert!(matches!(err, IngestError::Verification(VerificationError::MissingSignature)));
        assert!(f.store.get_item(f.user, "todoist", "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlinked_account_and_ignored_events() {
        let f = fixture(100).await;
        let body = serde_json::to_vec(&serde_json::json!({
            "event_name": "item:updated", "account": "someone-else", "data": {"id": "1", "title": "x"}
        }))
        .unwrap();
        let out = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        assert_eq!(
            out,
            IngestOutcome::UnknownOwner {
                account_id: Some("someone-else".to_string())
            }
        );

        let body = delivery("project:archived", "1", "x");
        let out = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        assert_eq!(
            out,
            IngestOutcome::Ignored {
                event_name: "project:archived".to_string()
            }
        );
    }

    #[tokio::test]
    async fn delete_delivery_retracts_pending_row() {
        let f = fixture(100).await;
        let body = delivery("item:updated", "42", "File taxes");
        f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();

        let body = delivery("item:deleted", "42", "File taxes");
        let out = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        let IngestOutcome::Applied { sync, triage, .. } = out else {
            panic!("expected applied");
        };
        assert_eq!(sync.items_removed, 1);
        assert_eq!(triage.retracted, 1);
        assert!(f.engine.triage().list(f.user, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_limit_applies_per_account() {
        let f = fixture(1).await;
        let body = delivery("project:archived", "1", "x");
        f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap();
        let err = f.ingestor.ingest("todoist", &signed(&body), &body).await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited(_)));
    }

    #[tokio::test]
    async fn garbage_and_unknown_providers() {
        let f = fixture(100).await;
        let err = f.ingestor.ingest("todoist", &HeaderMap::new(), b"not json").await.unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
        let err = f.ingestor.ingest("nope", &HeaderMap::new(), b"{}").await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownProvider(_)));
    }
}
