use axum::Router;
use axum::routing::get;

pub mod credentials;
pub mod health;
pub mod pinned;
pub mod sync;
pub mod triage;
pub mod webhooks;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .merge(webhooks::router())
        .merge(sync::router())
        .merge(triage::router())
        .merge(credentials::router())
        .merge(pinned::router())
}
