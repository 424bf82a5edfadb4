//! Todoist adapter.
//!
//! Incremental pulls use the Sync API `sync_token`; webhooks carry the full
//! item in `event_data` and are signed with the app's client secret.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use sundial_core::sync::{FetchResult, ProviderRawItem, WebhookDelta, WebhookDescriptor};
use sundial_core::webhooks::VerifiedEvent;
use sundial_core::{AdapterError, Due, ItemDetails, NormalizedItem, ProviderAdapter, TaskPriority};
use tracing::instrument;

use crate::http;

pub const PROVIDER: &str = "todoist";
/// Header carrying the base64 HMAC-SHA256 of the body.
pub const WEBHOOK_HEADER: &str = "x-todoist-hmac-sha256";
const DEFAULT_BASE: &str = "https://api.todoist.com/sync/v9";

#[derive(Debug, Deserialize)]
struct SyncResponse {
    sync_token: String,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TodoistItem {
    id: String,
    content: String,
    #[serde(default)]
    priority: u8,
    due: Option<TodoistDue>,
    #[serde(default)]
    checked: bool,
    #[serde(default)]
    is_deleted: bool,
    added_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TodoistDue {
    date: String,
    datetime: Option<String>,
}

#[derive(Debug, Clone)]
struct AppCredentials {
    client_id: String,
    client_secret: String,
}

#[derive(Clone)]
pub struct TodoistAdapter {
    client: Client,
    base_url: String,
    app: Option<AppCredentials>,
}

impl TodoistAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            client: http::client(http::DEFAULT_TIMEOUT)?,
            base_url: DEFAULT_BASE.to_string(),
            app: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// App credentials enable token revocation on disconnect.
    pub fn with_app_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.app = Some(AppCredentials {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        });
        self
    }
}

fn parse_ts(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_due(due: &TodoistDue) -> Option<Due> {
    if let Some(at) = parse_ts(due.datetime.as_deref()) {
        return Some(Due::At(at));
    }
    // Floating datetimes and plain dates both start with YYYY-MM-DD.
    let day = due.date.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok().map(Due::Date)
}

/// Todoist ids arrive as strings in v9 but as numbers in older payloads.
fn id_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn split_items(items: Vec<serde_json::Value>) -> (Vec<ProviderRawItem>, Vec<String>) {
    let mut upserts = Vec::new();
    let mut removed = Vec::new();
    for payload in items {
        let Some(id) = payload.get("id").and_then(id_string) else {
            tracing::warn!("todoist item without id");
            continue;
        };
        if payload.get("is_deleted").and_then(|v| v.as_bool()).unwrap_or(false) {
            removed.push(id);
        } else {
            upserts.push(ProviderRawItem {
                source_id: id,
                payload,
            });
        }
    }
    (upserts, removed)
}

#[async_trait]
impl ProviderAdapter for TodoistAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn fetch_changes(
        &self,
        secret: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchResult, AdapterError> {
        let token = http::access_token(PROVIDER, secret)?;
        let resp = self
            .client
            .post(format!("{}/sync", self.base_url))
            .bearer_auth(&token)
            .form(&[
                ("sync_token", cursor.unwrap_or("*")),
                ("resource_types", r#"["items"]"#),
            ])
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        let body: SyncResponse = http::json(PROVIDER, resp).await?;

        let (items, removed) = split_items(body.items);
        Ok(FetchResult {
            items,
            removed,
            next_cursor: Some(body.sync_token),
            rotated_secret: None,
        })
    }

    fn normalize(&self, raw: &ProviderRawItem) -> Result<NormalizedItem, AdapterError> {
        let mut payload = raw.payload.clone();
        // v8-style numeric ids
        if let Some(id) = payload.get("id").and_then(id_string) {
            payload["id"] = serde_json::Value::String(id);
        }
        let item: TodoistItem = serde_json::from_value(payload)
            .map_err(|e| AdapterError::Unknown(format!("todoist item {}: {e}", raw.source_id)))?;
        let updated = parse_ts(item.updated_at.as_deref());
        let timestamp = parse_ts(item.added_at.as_deref())
            .or(updated)
            .unwrap_or_else(Utc::now);

        NormalizedItem::new(
            PROVIDER,
            item.id,
            item.content,
            timestamp,
            ItemDetails::Task {
                priority: TaskPriority::from_todoist(item.priority),
                due: item.due.as_ref().and_then(parse_due),
            },
            raw.payload.clone(),
        )
        .map(|n| {
            n.with_completed(item.checked || item.is_deleted)
                .with_remote_updated_at(updated)
        })
        .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    fn describe_webhook(&self, payload: &serde_json::Value) -> WebhookDescriptor {
        WebhookDescriptor {
            event_name: payload
                .get("event_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            account_id: payload.get("user_id").and_then(id_string),
        }
    }

    fn interpret_webhook(&self, event: &VerifiedEvent) -> Result<WebhookDelta, AdapterError> {
        let data = event
            .payload
            .get("event_data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        match event.event_name.as_str() {
            "item:added" | "item:updated" | "item:completed" | "item:uncompleted" => {
                let id = data
                    .get("id")
                    .and_then(id_string)
                    .ok_or_else(|| AdapterError::Unknown("todoist event_data has no id".to_string()))?;
                Ok(WebhookDelta::Upsert(vec![ProviderRawItem {
                    source_id: id,
                    payload: data,
                }]))
            }
            "item:deleted" => {
                let id = data
                    .get("id")
                    .and_then(id_string)
                    .ok_or_else(|| AdapterError::Unknown("todoist event_data has no id".to_string()))?;
                Ok(WebhookDelta::Remove(vec![id]))
            }
            _ => Ok(WebhookDelta::Ignore),
        }
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn revoke(&self, secret: &serde_json::Value) -> Result<(), AdapterError> {
        let Some(app) = &self.app else {
            tracing::debug!("todoist app credentials not configured; skipping remote revoke");
            return Ok(());
        };
        let token = http::access_token(PROVIDER, secret)?;
        let resp = self
            .client
            .post(format!("{}/access_tokens/revoke", self.base_url))
            .json(&serde_json::json!({
                "client_id": app.client_id,
                "client_secret": app.client_secret,
                "access_token": token,
            }))
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        http::check(PROVIDER, resp).await?;
        Ok(())
    }
}
