use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

use super::models::{
    AdapterOutcome, DisconnectOutcome, FailureKind, ProviderSyncResult, SyncFailure, SyncRun,
};
use super::traits::{ProviderAdapter, RevokePolicy, WebhookDelta};
use crate::models::UserId;
use crate::ratelimit::RateLimiter;
use crate::store::{ItemStore, UpsertOutcome};
use crate::triage::{TriageEngine, TriageOutcome};
use crate::vault::CredentialManager;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound for one adapter's whole fetch/normalize/upsert step.
    pub adapter_timeout: Duration,
    /// Users synced at once by `sync_all_users`.
    pub max_concurrent_users: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(30),
            max_concurrent_users: 4,
        }
    }
}

/// Fans a user's sync out over every linked provider adapter.
///
/// Cheap to clone; all state sits behind `Arc`s so runs can be spawned.
#[derive(Clone)]
pub struct SyncEngine {
    credentials: CredentialManager,
    items: Arc<dyn ItemStore>,
    triage: TriageEngine,
    outbound: RateLimiter,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        credentials: CredentialManager,
        items: Arc<dyn ItemStore>,
        triage: TriageEngine,
        outbound: RateLimiter,
        config: SyncConfig,
    ) -> Self {
        Self {
            credentials,
            items,
            triage,
            outbound,
            adapters: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, adapter), fields(provider = adapter.provider()))]
    pub async fn register_adapter(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .await
            .insert(adapter.provider().to_string(), adapter);
    }

    pub async fn adapter(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .await
            .get(provider)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("provider '{provider}' not registered")))
    }

    pub async fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn triage(&self) -> &TriageEngine {
        &self.triage
    }

    /// Sync every linked provider of one user concurrently, then score.
    ///
    /// Adapter failures never fail the run; they are captured per provider.
    #[tracing::instrument(level = "info", skip(self), fields(user_id = %user_id))]
    pub async fn sync_user(&self, user_id: UserId) -> Result<SyncRun> {
        let started_at = Utc::now();
        let linked: HashSet<String> = self
            .credentials
            .list_providers(user_id)
            .await?
            .into_iter()
            .collect();

        let registered: Vec<Arc<dyn ProviderAdapter>> = {
            let adapters = self.adapters.read().await;
            let mut v: Vec<_> = adapters.values().cloned().collect();
            v.sort_by_key(|a| a.provider());
            v
        };

        let mut skipped = Vec::new();
        let mut handles = Vec::new();
        for adapter in registered {
            let provider = adapter.provider();
            if !linked.contains(provider) {
                skipped.push(provider.to_string());
                continue;
            }
            let engine = self.clone();
            handles.push((
                provider,
                tokio::spawn(async move { engine.run_adapter(user_id, adapter).await }),
            ));
        }

        let mut adapters = BTreeMap::new();
        for (provider, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => AdapterOutcome::failed(SyncFailure::new(
                    FailureKind::Unknown,
                    format!("adapter task panicked: {e}"),
                )),
            };
            if let Some(err) = &outcome.error {
                tracing::warn!(provider, kind = ?err.kind, error = %err.message, "adapter sync failed");
            }
            adapters.insert(provider.to_string(), outcome);
        }

        let triage = self.triage.run_pass(user_id).await;

        Ok(SyncRun {
            user_id,
            started_at,
            finished_at: Utc::now(),
            adapters,
            skipped,
            triage,
            error: None,
        })
    }

    /// Sync one provider for one user, then score.
    #[tracing::instrument(level = "info", skip(self), fields(user_id = %user_id))]
    pub async fn sync_provider(&self, user_id: UserId, provider: &str) -> Result<ProviderSyncResult> {
        let adapter = self.adapter(provider).await?;
        if !self
            .credentials
            .list_providers(user_id)
            .await?
            .iter()
            .any(|p| p == provider)
        {
            return Err(Error::NotFound(format!("{provider} is not connected")));
        }
        let outcome = self.run_adapter(user_id, adapter).await;
        let triage = self.triage.run_pass(user_id).await;
        let (error, error_kind) = match outcome.error {
            Some(f) => (Some(f.message), Some(f.kind)),
            None => (None, None),
        };
        Ok(ProviderSyncResult {
            synced: outcome.items_synced,
            error,
            error_kind,
            triage,
        })
    }

    /// Provider said "something changed" without sending the data.
    pub async fn resync_from_webhook(&self, user_id: UserId, provider: &str) -> Result<AdapterOutcome> {
        let adapter = self.adapter(provider).await?;
        Ok(self.run_adapter(user_id, adapter).await)
    }

    /// Every user with at least one credential, bounded by `max_concurrent_users`.
    pub async fn sync_all_users(&self) -> Result<Vec<SyncRun>> {
        let users = self.credentials.linked_users().await?;
        Ok(self.sync_users(users).await)
    }

    #[tracing::instrument(level = "info", skip(self, users), fields(users = users.len()))]
    pub async fn sync_users(&self, users: Vec<UserId>) -> Vec<SyncRun> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_users.max(1)));
        let mut handles = Vec::with_capacity(users.len());
        for user_id in users {
            let engine = self.clone();
            let permits = permits.clone();
            handles.push((
                user_id,
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    engine.sync_user(user_id).await
                }),
            ));
        }

        let mut runs = Vec::with_capacity(handles.len());
        for (user_id, handle) in handles {
            let run = match handle.await {
                Ok(Ok(run)) => run,
                Ok(Err(e)) => {
                    tracing::warn!(%user_id, error = %e, "user sync could not start");
                    SyncRun::failed_to_start(user_id, Utc::now(), e.to_string())
                }
                Err(e) => SyncRun::failed_to_start(
                    user_id,
                    Utc::now(),
                    format!("user sync task panicked: {e}"),
                ),
            };
            runs.push(run);
        }
        runs
    }

    /// Apply a webhook delta through the same upsert path a pull uses.
    ///
    /// Returns `None` for the triage outcome when nothing was written.
    #[tracing::instrument(level = "info", skip(self, delta), fields(user_id = %user_id))]
    pub async fn apply_delta(
        &self,
        user_id: UserId,
        provider: &str,
        delta: WebhookDelta,
    ) -> Result<(AdapterOutcome, Option<TriageOutcome>)> {
        let adapter = self.adapter(provider).await?;
        let outcome = match delta {
            WebhookDelta::Ignore => return Ok((AdapterOutcome::default(), None)),
            WebhookDelta::Resync => self.run_adapter(user_id, adapter).await,
            WebhookDelta::Upsert(raw) => {
                let mut outcome = AdapterOutcome::default();
                self.store_items(user_id, adapter.as_ref(), &raw, &[], &mut outcome)
                    .await?;
                outcome
            }
            WebhookDelta::Remove(ids) => {
                let mut outcome = AdapterOutcome::default();
                self.store_items(user_id, adapter.as_ref(), &[], &ids, &mut outcome)
                    .await?;
                outcome
            }
        };
        let triage = self.triage.run_pass(user_id).await;
        Ok((outcome, Some(triage)))
    }

    /// Remove a provider link, revoking remotely per the adapter's policy.
    #[tracing::instrument(level = "info", skip(self), fields(user_id = %user_id))]
    pub async fn disconnect(&self, user_id: UserId, provider: &str) -> Result<DisconnectOutcome> {
        let adapter = self.adapter(provider).await.ok();
        let policy = adapter
            .as_ref()
            .map(|a| a.revoke_policy())
            .unwrap_or(RevokePolicy::BestEffort);

        let revoke = match (&adapter, self.credentials.retrieve(user_id, provider).await) {
            (_, Ok(None)) => {
                return Err(Error::NotFound(format!("{provider} is not connected")));
            }
            (Some(adapter), Ok(Some(secret))) => adapter.revoke(&secret).await.map_err(|e| e.to_string()),
            (None, Ok(Some(_))) => Ok(()),
            (_, Err(e)) => Err(e.to_string()),
        };

        let revoke_error = match revoke {
            Ok(()) => None,
            Err(e) if policy == RevokePolicy::MustSucceed => {
                return Err(Error::Conflict(format!(
                    "remote revoke for {provider} failed, credential kept: {e}"
                )));
            }
            Err(e) => {
                tracing::warn!(provider, error = %e, "remote revoke failed; removing local credential");
                Some(e)
            }
        };

        let removed = self.credentials.delete(user_id, provider).await?;
        Ok(DisconnectOutcome {
            provider: provider.to_string(),
            removed,
            remote_revoked: revoke_error.is_none(),
            revoke_error,
        })
    }

    async fn run_adapter(&self, user_id: UserId, adapter: Arc<dyn ProviderAdapter>) -> AdapterOutcome {
        let provider = adapter.provider();
        match tokio::time::timeout(
            self.config.adapter_timeout,
            self.sync_adapter(user_id, adapter.as_ref()),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => AdapterOutcome::failed(failure),
            Err(_) => AdapterOutcome::failed(SyncFailure::new(
                FailureKind::Timeout,
                format!(
                    "{provider} did not finish within {}ms",
                    self.config.adapter_timeout.as_millis()
                ),
            )),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, adapter), fields(user_id = %user_id, provider = adapter.provider()))]
    async fn sync_adapter(
        &self,
        user_id: UserId,
        adapter: &dyn ProviderAdapter,
    ) -> std::result::Result<AdapterOutcome, SyncFailure> {
        let provider = adapter.provider();

        self.outbound
            .check(&format!("{user_id}:{provider}"))
            .await
            .map_err(|e| SyncFailure::new(FailureKind::RateLimited, e.to_string()))?;

        let secret = self
            .credentials
            .retrieve(user_id, provider)
            .await?
            .ok_or_else(|| SyncFailure::new(FailureKind::AuthExpired, format!("{provider} credential missing")))?;

        let cursor = self
            .items
            .get_cursor(user_id, provider)
            .await
            .map_err(SyncFailure::storage)?;

        let fetched = adapter.fetch_changes(&secret, cursor.as_deref()).await?;

        if let Some(rotated) = &fetched.rotated_secret {
            self.credentials
                .rotate(user_id, provider, rotated)
                .await
                .map_err(SyncFailure::storage)?;
        }

        let mut outcome = AdapterOutcome::default();
        self.store_items(user_id, adapter, &fetched.items, &fetched.removed, &mut outcome)
            .await
            .map_err(SyncFailure::storage)?;

        if let Some(next) = &fetched.next_cursor {
            self.items
                .save_cursor(user_id, provider, next, Utc::now())
                .await
                .map_err(SyncFailure::storage)?;
        }

        tracing::debug!(
            synced = outcome.items_synced,
            removed = outcome.items_removed,
            stale = outcome.items_stale,
            skipped = outcome.items_skipped,
            "adapter sync finished"
        );
        Ok(outcome)
    }

    async fn store_items(
        &self,
        user_id: UserId,
        adapter: &dyn ProviderAdapter,
        raw: &[super::traits::ProviderRawItem],
        removed: &[String],
        outcome: &mut AdapterOutcome,
    ) -> Result<()> {
        let provider = adapter.provider();
        for record in raw {
            let item = match adapter.normalize(record) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(provider, source_id = %record.source_id, error = %e, "skipping malformed record");
                    outcome.items_skipped += 1;
                    continue;
                }
            };
            match self.items.upsert_item(user_id, &item, Utc::now()).await? {
                UpsertOutcome::Applied => outcome.items_synced += 1,
                UpsertOutcome::Stale => outcome.items_stale += 1,
            }
        }
        for source_id in removed {
            if self
                .items
                .retract_item(user_id, provider, source_id, Utc::now())
                .await?
            {
                outcome.items_removed += 1;
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedAdapter};
    use super::*;
    use crate::models::ItemKind;
    use crate::ratelimit::{MemoryCounterStore, RateLimitPolicy};
    use crate::store::{CredentialStore, SqliteStore};
    use crate::sync::traits::AdapterError;
    use crate::vault::CredentialVault;
    use uuid::Uuid;

    struct Harness {
        store: Arc<SqliteStore>,
        engine: SyncEngine,
    }

    async fn harness(timeout: Duration) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let vault = CredentialVault::from_bytes(&[9u8; 32]).unwrap();
        let credentials = CredentialManager::new(store.clone(), vault);
        let triage = TriageEngine::new(store.clone(), store.clone());
        let outbound = RateLimiter::new(
            RateLimitPolicy::outbound_provider(100, Duration::from_secs(60)),
            Arc::new(MemoryCounterStore::new()),
        );
        let engine = SyncEngine::new(
            credentials,
            store.clone(),
            triage,
            outbound,
            SyncConfig {
                adapter_timeout: timeout,
                max_concurrent_users: 2,
            },
        );
        Harness { store, engine }
    }

    async fn link(h: &Harness, user: UserId, provider: &str) {
        h.engine
            .credentials()
            .store(user, provider, &serde_json::json!({"token": provider}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn one_failing_adapter_does_not_affect_the_others() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("a", Script::Items(vec![("1", "one"), ("2", "two")]))))
            .await;
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new(
                "b",
                Script::Fail(AdapterError::AuthExpired("token revoked".into())),
            )))
            .await;
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("c", Script::Items(vec![("3", "three")]))))
            .await;
        for p in ["a", "b", "c"] {
            link(&h, user, p).await;
        }

        let run = h.engine.sync_user(user).await.unwrap();
        assert_eq!(run.adapters["a"].items_synced, 2);
        assert!(run.adapters["a"].is_ok());
        assert_eq!(run.adapters["b"].error.as_ref().unwrap().kind, FailureKind::AuthExpired);
        assert_eq!(run.adapters["c"].items_synced, 1);
        assert_eq!(run.triage.scored, 3);
        assert_eq!(run.failures().count(), 1);
    }

    #[tokio::test]
    async fn hanging_adapter_times_out_alone() {
        let h = harness(Duration::from_millis(100)).await;
        let user = UserId(Uuid::new_v4());
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("slow", Script::Hang)))
            .await;
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("fast", Script::Items(vec![("1", "x")]))))
            .await;
        link(&h, user, "slow").await;
        link(&h, user, "fast").await;

        let run = h.engine.sync_user(user).await.unwrap();
        assert_eq!(run.adapters["slow"].error.as_ref().unwrap().kind, FailureKind::Timeout);
        assert_eq!(run.adapters["fast"].items_synced, 1);
    }

    #[tokio::test]
    async fn unlinked_adapters_are_skipped() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        let plaid = Arc::new(ScriptedAdapter::new("plaid", Script::Items(vec![])));
        h.engine.register_adapter(plaid.clone()).await;
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![("1", "x")]))))
            .await;
        link(&h, user, "todoist").await;

        let run = h.engine.sync_user(user).await.unwrap();
        assert_eq!(run.skipped, vec!["plaid".to_string()]);
        assert!(!run.adapters.contains_key("plaid"));
        assert_eq!(plaid.calls(), 0);
    }

    #[tokio::test]
    async fn repeated_syncs_are_idempotent_and_advance_the_cursor() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        let first = ScriptedAdapter::new("todoist", Script::Items(vec![("1", "x"), ("2", "y")]));
        h.engine.register_adapter(Arc::new(first)).await;
        link(&h, user, "todoist").await;
        h.engine.sync_user(user).await.unwrap();

        // The provider reports an edit to item 1 on the next fetch.
        let edited = Arc::new(ScriptedAdapter::new(
            "todoist",
            Script::Items(vec![("1", "x renamed"), ("2", "y")]),
        ));
        h.engine.register_adapter(edited.clone()).await;
        h.engine.sync_user(user).await.unwrap();

        let mut tasks = h.store.list_items_by_kind(user, ItemKind::Task).await.unwrap();
        tasks.sort_by(|a, b| a.item.source_id.cmp(&b.item.source_id));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].item.title, "x renamed");
        let queue = h.engine.triage().list(user, None, None).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().any(|q| q.title == "x renamed"));
        assert_eq!(edited.seen_cursor.lock().unwrap().as_deref(), Some("cursor-1"));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![("1", ""), ("2", "ok")]))))
            .await;
        link(&h, user, "todoist").await;
        let result = h.engine.sync_provider(user, "todoist").await.unwrap();
        assert_eq!(result.synced, 1);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn unreadable_credential_asks_for_reconnect() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![("1", "x")]))))
            .await;
        link(&h, user, "todoist").await;
        let mut row = h.store.get_credential(user, "todoist").await.unwrap().unwrap();
        row.ciphertext[0] ^= 0xff;
        h.store.upsert_credential(&row).await.unwrap();

        let result = h.engine.sync_provider(user, "todoist").await.unwrap();
        assert_eq!(result.error_kind, Some(FailureKind::CredentialUnreadable));
        assert!(result.error.is_some());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["error"].is_string());
        assert_eq!(json["error_kind"], "credential_unreadable");
    }

    #[tokio::test]
    async fn rotated_tokens_are_persisted() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());
        let mut adapter = ScriptedAdapter::new("google_calendar", Script::Items(vec![]));
        adapter.rotate_to = Some(serde_json::json!({"token": "fresh"}));
        h.engine.register_adapter(Arc::new(adapter)).await;
        link(&h, user, "google_calendar").await;

        h.engine.sync_provider(user, "google_calendar").await.unwrap();
        assert_eq!(
            h.engine.credentials().retrieve(user, "google_calendar").await.unwrap(),
            Some(serde_json::json!({"token": "fresh"}))
        );
    }

    #[tokio::test]
    async fn outbound_limit_is_reported_as_rate_limited() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let credentials = CredentialManager::new(store.clone(), CredentialVault::from_bytes(&[1u8; 32]).unwrap());
        let engine = SyncEngine::new(
            credentials,
            store.clone(),
            TriageEngine::new(store.clone(), store.clone()),
            RateLimiter::new(
                RateLimitPolicy::outbound_provider(1, Duration::from_secs(60)),
                Arc::new(MemoryCounterStore::new()),
            ),
            SyncConfig::default(),
        );
        engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![]))))
            .await;
        let user = UserId(Uuid::new_v4());
        engine
            .credentials()
            .store(user, "todoist", &serde_json::json!({}), None)
            .await
            .unwrap();

        assert!(engine.sync_provider(user, "todoist").await.unwrap().error.is_none());
        let second = engine.sync_provider(user, "todoist").await.unwrap();
        assert_eq!(second.error_kind, Some(FailureKind::RateLimited));
    }

    #[tokio::test]
    async fn all_users_sync_independently() {
        let h = harness(Duration::from_secs(5)).await;
        h.engine
            .register_adapter(Arc::new(ScriptedAdapter::new("todoist", Script::Items(vec![("1", "x")]))))
            .await;
        let users: Vec<UserId> = (0..5).map(|_| UserId(Uuid::new_v4())).collect();
        for u in &users {
            link(&h, *u, "todoist").await;
        }
        let runs = h.engine.sync_all_users().await.unwrap();
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|r| r.error.is_none() && r.adapters["todoist"].items_synced == 1));
    }

    #[tokio::test]
    async fn disconnect_follows_revoke_policy() {
        let h = harness(Duration::from_secs(5)).await;
        let user = UserId(Uuid::new_v4());

        let mut strict = ScriptedAdapter::new("plaid", Script::Items(vec![]));
        strict.policy = RevokePolicy::MustSucceed;
        strict.revoke_fails = true;
        h.engine.register_adapter(Arc::new(strict)).await;

        let mut lenient = ScriptedAdapter::new("google_calendar", Script::Items(vec![]));
        lenient.revoke_fails = true;
        h.engine.register_adapter(Arc::new(lenient)).await;

        link(&h, user, "plaid").await;
        link(&h, user, "google_calendar").await;

        let err = h.engine.disconnect(user, "plaid").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(h.engine.credentials().retrieve(user, "plaid").await.unwrap().is_some());

        let out = h.engine.disconnect(user, "google_calendar").await.unwrap();
        assert!(out.removed);
        assert!(!out.remote_revoked);
        assert!(out.revoke_error.is_some());

        let err = h.engine.disconnect(user, "google_calendar").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
