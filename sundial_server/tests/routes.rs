use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use sundial_core::ratelimit::{CounterStore, MemoryCounterStore, RateLimitPolicy};
use sundial_core::store::{ItemStore, SqliteStore, TriageQueueStore};
use sundial_core::sync::{FetchResult, ProviderRawItem, WebhookDelta, WebhookDescriptor};
use sundial_core::webhooks::signature::sign_hmac_sha256_hex;
use sundial_core::webhooks::{KeyCache, VerifiedEvent};
use sundial_core::{
    AdapterError, CredentialManager, CredentialVault, ItemDetails, LimiterPolicies, Limiters,
    NormalizedItem, ProviderAdapter, SyncConfig, SyncEngine, TaskPriority, TriageEngine, UserId,
    WebhookIngestor, WebhookVerifier,
};
use sundial_server::server::{AppState, router};
use tower::ServiceExt;
use uuid::Uuid;

const HOOK_SECRET: &str = "tasks-webhook-secret";
const HOOK_HEADER: &str = "x-tasks-signature";
const CRON: &str = "cron-secret-0123456789";

struct FakeTasks;

#[async_trait]
impl ProviderAdapter for FakeTasks {
    fn provider(&self) -> &'static str {
        "tasks"
    }

    async fn fetch_changes(
        &self,
        _secret: &serde_json::Value,
        _cursor: Option<&str>,
    ) -> Result<FetchResult, AdapterError> {
        Ok(FetchResult {
            items: vec![
                ProviderRawItem {
                    source_id: "t1".to_string(),
                    payload: serde_json::json!({"id": "t1", "title": "file taxes"}),
                },
                ProviderRawItem {
                    source_id: "t2".to_string(),
                    payload: serde_json::json!({"id": "t2", "title": "renew passport"}),
                },
            ],
            next_cursor: Some("c1".to_string()),
            ..FetchResult::default()
        })
    }

    fn normalize(&self, raw: &ProviderRawItem) -> Result<NormalizedItem, AdapterError> {
        let title = raw.payload["title"]
            .as_str()
            .ok_or_else(|| AdapterError::Unknown("title missing".to_string()))?;
        NormalizedItem::new(
            "tasks",
            raw.source_id.clone(),
            title,
            Utc::now(),
            ItemDetails::Task {
                priority: TaskPriority::High,
                due: None,
            },
            raw.payload.clone(),
        )
        .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    fn describe_webhook(&self, payload: &serde_json::Value) -> WebhookDescriptor {
        WebhookDescriptor {
            event_name: payload["event_name"].as_str().unwrap_or_default().to_string(),
            account_id: payload["account"].as_str().map(str::to_string),
        }
    }

    fn interpret_webhook(&self, event: &VerifiedEvent) -> Result<WebhookDelta, AdapterError> {
        let data = &event.payload["data"];
        match event.event_name.as_str() {
            "item:updated" => Ok(WebhookDelta::Upsert(vec![ProviderRawItem {
                source_id: data["id"].as_str().unwrap_or_default().to_string(),
                payload: data.clone(),
            }])),
            _ => Ok(WebhookDelta::Ignore),
        }
    }
}

async fn app_with(cron_secret: Option<&str>, user_sync_cap: u64) -> Router {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let vault = CredentialVault::from_key_material(Some(&CredentialVault::generate_key())).unwrap();
    let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    let limiters = Limiters::new(
        counters,
        LimiterPolicies {
            user_sync: RateLimitPolicy::user_sync(user_sync_cap, Duration::from_secs(60)),
            ..LimiterPolicies::default()
        },
    );
    let items: Arc<dyn ItemStore> = store.clone();
    let queue: Arc<dyn TriageQueueStore> = store.clone();

    let engine = SyncEngine::new(
        CredentialManager::new(store.clone(), vault),
        items.clone(),
        TriageEngine::new(items.clone(), queue.clone()),
        limiters.outbound_provider.clone(),
        SyncConfig::default(),
    );
    engine.register_adapter(Arc::new(FakeTasks)).await;

    let verifier = WebhookVerifier::new(Arc::new(KeyCache::default())).with_hmac(
        "tasks",
        HOOK_SECRET,
        HOOK_HEADER,
    );
    let ingestor = WebhookIngestor::new(
        Arc::new(verifier),
        engine.clone(),
        limiters.inbound_webhook.clone(),
    );
    router(AppState::new(
        engine,
        ingestor,
        limiters.user_sync,
        items,
        queue,
        cron_secret.map(str::to_string),
    ))
}

async fn app() -> Router {
    app_with(Some(CRON), 10).await
}

fn user() -> UserId {
    UserId(Uuid::new_v4())
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

fn req(method: &str, uri: &str, user: Option<UserId>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut b = Request::builder().method(method).uri(uri);
    if let Some(u) = user {
        b = b.header("x-user-id", u.to_string());
    }
    match body {
        Some(v) => b
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => b.body(Body::empty()).unwrap(),
    }
}

async fn link_account(app: &Router, user: UserId, account: &str) -> StatusCode {
    let (status, _, _) = send(
        app,
        req(
            "PUT",
            "/credentials/tasks",
            Some(user),
            Some(serde_json::json!({"secret": {"token": "tok-1"}, "external_account_id": account})),
        ),
    )
    .await;
    status
}

async fn link(app: &Router, user: UserId) {
    assert_eq!(link_account(app, user, "acct-1").await, StatusCode::OK);
}

#[tokio::test]
async fn health_lists_registered_providers() {
    let app = app().await;
    let (status, _, body) = send(&app, req("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["providers"], serde_json::json!(["tasks"]));
}

#[tokio::test]
async fn user_routes_require_a_valid_user_header() {
    let app = app().await;
    let (status, _, _) = send(&app, req("GET", "/credentials", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bad = Request::builder()
        .uri("/credentials")
        .header("x-user-id", "not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn credentials_link_list_and_disconnect() {
    let app = app().await;
    let u = user();
    link(&app, u).await;

    let (status, _, body) = send(&app, req("GET", "/credentials", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["provider"], "tasks");
    assert_eq!(body[0]["external_account_id"], "acct-1");
    assert!(!body.to_string().contains("tok-1"));

    let (status, _, body) = send(&app, req("DELETE", "/credentials/tasks", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (_, _, body) = send(&app, req("GET", "/credentials", Some(u), None)).await;
    assert_eq!(body, serde_json::json!([]));

    let (status, _, _) = send(&app, req("DELETE", "/credentials/tasks", Some(u), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn credentials_reject_unknown_provider_and_non_object_secret() {
    let app = app().await;
    let u = user();
    let (status, _, _) = send(
        &app,
        req("PUT", "/credentials/nope", Some(u), Some(serde_json::json!({"secret": {"a": 1}}))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(
        &app,
        req("PUT", "/credentials/tasks", Some(u), Some(serde_json::json!({"secret": "plain"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn linked_account_cannot_be_claimed_by_another_user() {
    let app = app().await;
    let owner = user();
    link(&app, owner).await;

    let intruder = user();
    assert_eq!(link_account(&app, intruder, "acct-1").await, StatusCode::CONFLICT);
    let (_, _, body) = send(&app, req("GET", "/credentials", Some(intruder), None)).await;
    assert_eq!(body.as_array().map(Vec::len), Some(0));

    // Webhooks for the account still land on the original owner.
    let payload = serde_json::json!({
        "event_name": "item:updated",
        "account": "acct-1",
        "data": {"id": "t9", "title": "call the bank"},
    });
    let raw = payload.to_string();
    let hook = Request::builder()
        .method("POST")
        .uri("/webhooks/tasks")
        .header(HOOK_HEADER, sign_hmac_sha256_hex(HOOK_SECRET.as_bytes(), raw.as_bytes()))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(raw))
        .unwrap();
    let (status, _, _) = send(&app, hook).await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, owner_queue) = send(&app, req("GET", "/triage", Some(owner), None)).await;
    assert!(owner_queue.as_array().unwrap().iter().any(|r| r["source_id"] == "t9"));
    let (_, _, intruder_queue) = send(&app, req("GET", "/triage", Some(intruder), None)).await;
    assert_eq!(intruder_queue.as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn manual_sync_reports_counts() {
    let app = app().await;
    let u = user();
    link(&app, u).await;

    let (status, _, body) = send(&app, req("POST", "/sync/tasks", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], 2);
    assert_eq!(body["triage"]["scored"], 2);
    assert!(body.get("error").is_none());
    assert!(body.get("error_kind").is_none());
}

#[tokio::test]
async fn manual_sync_of_unlinked_provider_is_not_found() {
    let app = app().await;
    let (status, _, _) = send(&app, req("POST", "/sync/tasks", Some(user()), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manual_sync_is_rate_limited_per_user() {
    let app = app_with(Some(CRON), 1).await;
    let u = user();
    link(&app, u).await;

    let (status, _, _) = send(&app, req("POST", "/sync/tasks", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send(&app, req("POST", "/sync/tasks", Some(u), None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert!(body["reset_at"].is_string());

    // Another user has its own window.
    let other = user();
    assert_eq!(link_account(&app, other, "acct-2").await, StatusCode::OK);
    let (status, _, _) = send(&app, req("POST", "/sync/tasks", Some(other), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn sync_all_requires_the_cron_secret() {
    let app = app().await;
    let u = user();
    link(&app, u).await;

    let (status, _, _) = send(&app, req("POST", "/sync/all", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method("POST")
        .uri("/sync/all")
        .header(header::AUTHORIZATION, "Bearer not-the-secret")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let ok = Request::builder()
        .method("POST")
        .uri("/sync/all")
        .header(header::AUTHORIZATION, format!("Bearer {CRON}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, ok).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_eq!(body[0]["user_id"], u.to_string());
    assert_eq!(body[0]["adapters"]["tasks"]["items_synced"], 2);
    assert!(body[0]["adapters"]["tasks"].get("error").is_none());
    assert!(body[0]["skipped"].is_array());
    assert_eq!(body[0]["triage"]["scored"], 2);
    assert!(body[0]["started_at"].is_string());
}

#[tokio::test]
async fn sync_all_is_closed_without_a_configured_secret() {
    let app = app_with(None, 10).await;
    let r = Request::builder()
        .method("POST")
        .uri("/sync/all")
        .header(header::AUTHORIZATION, format!("Bearer {CRON}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, r).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn triage_list_filter_and_transitions() {
    let app = app().await;
    let u = user();
    link(&app, u).await;
    send(&app, req("POST", "/sync/tasks", Some(u), None)).await;

    let (status, _, body) = send(&app, req("GET", "/triage?status=pending", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    let id = rows[0]["id"].as_str().unwrap().to_string();

    let (_, _, body) = send(&app, req("GET", "/triage?limit=1", Some(u), None)).await;
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let uri = format!("/triage/{id}/status");
    let (status, _, body) = send(
        &app,
        req("POST", &uri, Some(u), Some(serde_json::json!({"status": "dismissed"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dismissed");

    let (status, _, _) = send(
        &app,
        req("POST", &uri, Some(u), Some(serde_json::json!({"status": "approved"}))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &app,
        req("POST", &uri, Some(u), Some(serde_json::json!({"status": "later"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, body) = send(&app, req("GET", "/triage?status=pending", Some(u), None)).await;
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    // Another user's row is invisible.
    let (status, _, _) = send(
        &app,
        req("POST", &uri, Some(user()), Some(serde_json::json!({"status": "approved"}))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhooks_always_acknowledge_and_apply_only_when_verified() {
    let app = app().await;
    let u = user();
    link(&app, u).await;

    let payload = serde_json::json!({
        "event_name": "item:updated",
        "account": "acct-1",
        "data": {"id": "w1", "title": "call the bank"},
    })
    .to_string();

    let forged = Request::builder()
        .method("POST")
        .uri("/webhooks/tasks")
        .header(HOOK_HEADER, "00".repeat(32))
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _, body) = send(&app, forged).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"received": true}));

    let (_, _, body) = send(&app, req("GET", "/triage", Some(u), None)).await;
    assert_eq!(body, serde_json::json!([]));

    let signed = Request::builder()
        .method("POST")
        .uri("/webhooks/tasks")
        .header(HOOK_HEADER, sign_hmac_sha256_hex(HOOK_SECRET.as_bytes(), payload.as_bytes()))
        .body(Body::from(payload))
        .unwrap();
    let (status, _, body) = send(&app, signed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"received": true}));

    let (_, _, body) = send(&app, req("GET", "/triage", Some(u), None)).await;
    assert_eq!(body[0]["source_id"], "w1");
    assert_eq!(body[0]["title"], "call the bank");

    let unknown = Request::builder()
        .method("POST")
        .uri("/webhooks/nobody")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, _) = send(&app, unknown).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn pinned_targets_resolve() {
    let app = app().await;
    let u = user();
    link(&app, u).await;
    send(&app, req("POST", "/sync/tasks", Some(u), None)).await;

    let (status, _, body) = send(&app, req("GET", "/pinned/task:t1", Some(u), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "file taxes");

    let (status, _, _) = send(&app, req("GET", "/pinned/task:missing", Some(u), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, req("GET", "/pinned/bogus", Some(u), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
