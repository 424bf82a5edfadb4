//! Inbound provider webhooks.
//!
//! Every delivery is acknowledged with `200 {"received": true}` so senders
//! cannot learn anything about verification or ownership. Outcomes are only logged.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Extension, Json};
use sundial_core::IngestOutcome;
use sundial_core::webhooks::IngestError;

use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/webhooks/{provider}", post(receive))
}

#[tracing::instrument(level = "info", skip(state, headers, body), fields(bytes = body.len()))]
async fn receive(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    match state.ingestor.ingest(&provider, &headers, &body).await {
        Ok(IngestOutcome::Applied { user_id, sync, triage }) => tracing::info!(
            %user_id,
            synced = sync.items_synced,
            removed = sync.items_removed,
            scored = triage.scored,
            "webhook applied"
        ),
        Ok(IngestOutcome::Ignored { event_name }) => {
            tracing::debug!(%event_name, "webhook ignored")
        }
        Ok(IngestOutcome::UnknownOwner { account_id }) => {
            tracing::info!(?account_id, "webhook for unknown account")
        }
        Err(IngestError::Verification(e)) => tracing::warn!(error = %e, "webhook rejected"),
        Err(IngestError::RateLimited(e)) => tracing::warn!(error = %e, "webhook throttled"),
        Err(e) => tracing::error!(error = %e, "webhook ingestion failed"),
    }
    Json(serde_json::json!({ "received": true }))
}
