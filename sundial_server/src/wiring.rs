//! Builds the application state from configuration.

use anyhow::Context;
use std::sync::Arc;
use sundial_core::config::SundialConfig;
use sundial_core::ratelimit::{CounterStore, RedisCounterStore};
use sundial_core::store::{ItemStore, SqliteStore, TriageQueueStore};
use sundial_core::webhooks::KeyCache;
use sundial_core::{
    CredentialManager, CredentialVault, Limiters, SyncEngine, TriageEngine, WebhookIngestor,
    WebhookVerifier,
};

use crate::server::AppState;

#[tracing::instrument(level = "info", skip_all, fields(db = %cfg.database_path.display()))]
pub async fn build_state(cfg: &SundialConfig) -> anyhow::Result<AppState> {
    if let Some(parent) = cfg.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
    }
    let store = Arc::new(SqliteStore::new(&cfg.database_path).await?);
    let vault = CredentialVault::from_key_material(cfg.master_key.as_deref())
        .context("load SUNDIAL_MASTER_KEY")?;

    let counters: Arc<dyn CounterStore> = match &cfg.redis {
        Some(redis) => {
            tracing::info!("rate limit counters in redis");
            Arc::new(RedisCounterStore::connect(&redis.url, Some(redis.key_prefix.as_str())).await?)
        }
        None => {
            tracing::info!("rate limit counters in sqlite");
            store.clone()
        }
    };
    let limiters = Limiters::new(counters, cfg.limits.clone());

    let items: Arc<dyn ItemStore> = store.clone();
    let queue: Arc<dyn TriageQueueStore> = store.clone();

    let mut triage = TriageEngine::new(items.clone(), queue.clone());
    if let Some(c) = &cfg.classifier {
        let classifier = sundial_integrations::classifier::LlmClassifier::new(
            &c.api_base,
            &c.api_key,
            &c.model,
            c.timeout,
        )?;
        triage = triage
            .with_classifier(Arc::new(classifier))
            .with_classifier_limiter(limiters.ai_classifier.clone());
    } else {
        tracing::info!("no classifier configured; rule scoring only");
    }

    let credentials = CredentialManager::new(store.clone(), vault);
    let engine = SyncEngine::new(
        credentials,
        items.clone(),
        triage,
        limiters.outbound_provider.clone(),
        cfg.sync.clone(),
    );
    let verifier = register_providers(cfg, &engine).await?;
    let ingestor = WebhookIngestor::new(
        Arc::new(verifier),
        engine.clone(),
        limiters.inbound_webhook.clone(),
    );

    tracing::info!(providers = ?engine.providers().await, "sync engine ready");
    Ok(AppState::new(
        engine,
        ingestor,
        limiters.user_sync,
        items,
        queue,
        cfg.cron_secret.clone(),
    ))
}

/// Registers an adapter per configured provider and the matching webhook
/// verification mode.
async fn register_providers(
    cfg: &SundialConfig,
    engine: &SyncEngine,
) -> anyhow::Result<WebhookVerifier> {
    use sundial_integrations::{google, plaid, todoist};

    let mut verifier = WebhookVerifier::new(Arc::new(KeyCache::default()));

    if let Some(t) = &cfg.todoist {
        let mut adapter = todoist::TodoistAdapter::new()?;
        if let Some(id) = &t.client_id {
            adapter = adapter.with_app_credentials(id, &t.client_secret);
        }
        engine.register_adapter(Arc::new(adapter)).await;
        verifier = verifier.with_hmac(todoist::PROVIDER, &t.client_secret, todoist::WEBHOOK_HEADER);
    }

    if let Some(p) = &cfg.plaid {
        let env: plaid::PlaidEnv = p.env.parse()?;
        let adapter = plaid::PlaidAdapter::new(env, &p.client_id, &p.secret)?;
        verifier = verifier.with_signed_claims(
            plaid::PROVIDER,
            plaid::WEBHOOK_HEADER,
            Arc::new(adapter.key_fetcher()),
        );
        engine.register_adapter(Arc::new(adapter)).await;
    }

    if let Some(g) = &cfg.google {
        let (calendar, gmail) = google::adapters(&g.client_id, &g.client_secret)?;
        engine.register_adapter(Arc::new(calendar)).await;
        engine.register_adapter(Arc::new(gmail)).await;
    }

    Ok(verifier)
}
