use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use sundial_core::{TriageQueueItem, TriageStatus};
use uuid::Uuid;

use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/triage", get(list_queue))
        .route("/triage/{id}/status", post(set_status))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// GET /triage?status=pending&limit=20
#[tracing::instrument(level = "debug", skip(state))]
async fn list_queue(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<TriageQueueItem>>, ApiError> {
    let status = q
        .status
        .as_deref()
        .map(TriageStatus::from_str)
        .transpose()?;
    let rows = state.engine.triage().list(user_id, status, q.limit).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

/// POST /triage/{id}/status {"status": "dismissed"}
#[tracing::instrument(level = "info", skip(state, body))]
async fn set_status(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusBody>,
) -> Result<Json<TriageQueueItem>, ApiError> {
    let to = TriageStatus::from_str(&body.status)?;
    let row = state.engine.triage().transition(user_id, id, to).await?;
    Ok(Json(row))
}
