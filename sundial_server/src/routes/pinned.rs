use std::str::FromStr;
use std::sync::Arc;

use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use sundial_core::{PinSummary, PinTarget};

use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/pinned/{target}", get(resolve))
}

/// GET /pinned/task:123 | email:abc | event:xyz | context:<uuid>
#[tracing::instrument(level = "debug", skip(state))]
async fn resolve(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(target): Path<String>,
) -> Result<Json<PinSummary>, ApiError> {
    let target = PinTarget::from_str(&target)?;
    let summary = target
        .resolve(user_id, state.items.as_ref(), state.queue.as_ref())
        .await?;
    Ok(Json(summary))
}
