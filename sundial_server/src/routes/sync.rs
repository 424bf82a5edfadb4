use std::sync::Arc;

use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use sundial_core::SyncRun;
use sundial_core::sync::ProviderSyncResult;

use crate::auth::CronAuth;
use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/sync/all", post(sync_all))
        .route("/sync/{provider}", post(sync_provider))
}

/// POST /sync/{provider}: manual sync for the calling user.
#[tracing::instrument(level = "info", skip(state))]
async fn sync_provider(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ProviderSyncResult>, ApiError> {
    state.user_sync.check(&user_id.to_string()).await?;
    let result = state.engine.sync_provider(user_id, &provider).await?;
    Ok(Json(result))
}

/// POST /sync/all: cron fan-out over every linked user, one run report each.
#[tracing::instrument(level = "info", skip_all)]
async fn sync_all(
    _auth: CronAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SyncRun>>, ApiError> {
    Ok(Json(state.engine.sync_all_users().await?))
}
