use std::sync::Arc;

use axum::{Extension, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub providers: Vec<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        providers: state.engine.providers().await,
    })
}
