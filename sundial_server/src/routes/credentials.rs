//! Provider credential routes. Secrets go in, never come back out.

use std::sync::Arc;

use axum::extract::Path;
use axum::routing::{get, put};
use axum::{Extension, Json};
use serde::Deserialize;
use sundial_core::sync::DisconnectOutcome;
use sundial_core::vault::LinkedProvider;

use crate::error::ApiError;
use crate::extract::UserIdHeader;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/credentials", get(list_credentials))
        .route(
            "/credentials/{provider}",
            put(put_credential).delete(delete_credential),
        )
}

/// GET /credentials: linked providers, without secret material.
#[tracing::instrument(level = "debug", skip_all)]
async fn list_credentials(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<LinkedProvider>>, ApiError> {
    Ok(Json(state.engine.credentials().list(user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PutCredentialBody {
    pub secret: serde_json::Value,
    /// Provider-side account id, used to route webhooks to this user.
    #[serde(default)]
    pub external_account_id: Option<String>,
}

/// PUT /credentials/{provider}
#[tracing::instrument(level = "info", skip(state, body))]
async fn put_credential(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(body): Json<PutCredentialBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !body.secret.is_object() {
        return Err(ApiError::InvalidInput("secret must be a JSON object".to_string()));
    }
    // Only registered providers can be linked.
    state.engine.adapter(&provider).await?;
    state
        .engine
        .credentials()
        .store(
            user_id,
            &provider,
            &body.secret,
            body.external_account_id.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "provider": provider, "status": "saved" })))
}

/// DELETE /credentials/{provider}: revoke remotely per provider policy, then drop.
#[tracing::instrument(level = "info", skip(state))]
async fn delete_credential(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<DisconnectOutcome>, ApiError> {
    Ok(Json(state.engine.disconnect(user_id, &provider).await?))
}
