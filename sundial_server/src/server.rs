use crate::routes;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sundial_core::store::{ItemStore, TriageQueueStore};
use sundial_core::{RateLimiter, SyncEngine, WebhookIngestor};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    pub ingestor: WebhookIngestor,
    /// Per-user limiter for manual sync requests.
    pub user_sync: RateLimiter,
    pub items: Arc<dyn ItemStore>,
    pub queue: Arc<dyn TriageQueueStore>,
    /// Bearer secret for `/sync/all`; the route is closed when unset.
    pub cron_secret: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        engine: SyncEngine,
        ingestor: WebhookIngestor,
        user_sync: RateLimiter,
        items: Arc<dyn ItemStore>,
        queue: Arc<dyn TriageQueueStore>,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            engine,
            ingestor,
            user_sync,
            items,
            queue,
            cron_secret,
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(routes::router())
        .layer(Extension(state))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve HTTP. With `sync_interval` set, a background loop also syncs every
/// linked user on that cadence.
#[tracing::instrument(level = "info", skip_all)]
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    sync_interval: Option<Duration>,
) -> anyhow::Result<()> {
    if let Some(every) = sync_interval {
        let engine = state.engine.clone();
        tokio::spawn(async move {
            tracing::info!(interval_secs = every.as_secs(), "background sync loop started");
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; let the server come up first.
            interval.tick().await;
            loop {
                interval.tick().await;
                match engine.sync_all_users().await {
                    Ok(runs) => {
                        let failed = runs
                            .iter()
                            .filter(|r| r.error.is_some() || r.failures().next().is_some())
                            .count();
                        tracing::info!(users = runs.len(), failed, "background sync pass finished");
                    }
                    Err(e) => tracing::warn!(error = %e, "background sync pass could not list users"),
                }
            }
        });
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
