//! Gmail adapter.
//!
//! Incremental sync follows the mailbox `historyId`. First pulls list recent
//! inbox messages and snapshot the profile's current history id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sundial_core::sync::{FetchResult, ProviderRawItem};
use sundial_core::{AdapterError, ItemDetails, NormalizedItem, ProviderAdapter};
use tracing::instrument;

use super::oauth::GoogleOAuth;
use crate::http;

pub const PROVIDER: &str = "gmail";
const DEFAULT_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const MAX_PAGES: usize = 10;
const INITIAL_MESSAGES: &str = "50";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    history_id: Option<String>,
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageChange>,
    #[serde(default)]
    messages_deleted: Vec<MessageChange>,
    #[serde(default)]
    labels_added: Vec<MessageChange>,
    #[serde(default)]
    labels_removed: Vec<MessageChange>,
}

#[derive(Debug, Deserialize)]
struct MessageChange {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    internal_date: Option<String>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Clone)]
pub struct GmailAdapter {
    client: Client,
    oauth: GoogleOAuth,
    base_url: String,
}

impl GmailAdapter {
    pub fn new(client: Client, oauth: GoogleOAuth) -> Self {
        Self {
            client,
            oauth,
            base_url: DEFAULT_BASE.to_string(),
        }
    }

    async fn get_message(&self, token: &str, id: &str) -> Result<Option<serde_json::Value>, AdapterError> {
        let resp = self
            .client
            .get(format!("{}/messages/{id}", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "Date"),
            ])
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        // Deleted between the history read and this fetch.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        http::json(PROVIDER, resp).await.map(Some)
    }

    async fn profile_history_id(&self, token: &str) -> Result<String, AdapterError> {
        let resp = self
            .client
            .get(format!("{}/profile", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        let p: Profile = http::json(PROVIDER, resp).await?;
        if p.history_id.trim().is_empty() {
            return Err(AdapterError::Unknown("gmail profile missing historyId".to_string()));
        }
        Ok(p.history_id)
    }

    async fn initial_pull(&self, token: &str) -> Result<(Vec<String>, String), AdapterError> {
        let resp = self
            .client
            .get(format!("{}/messages", self.base_url))
            .bearer_auth(token)
            .query(&[("maxResults", INITIAL_MESSAGES), ("labelIds", "INBOX")])
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        let list: MessageList = http::json(PROVIDER, resp).await?;
        let history_id = self.profile_history_id(token).await?;
        Ok((list.messages.into_iter().map(|m| m.id).collect(), history_id))
    }

    /// `None` when the history id is too old and a fresh pull is needed.
    async fn history_pull(
        &self,
        token: &str,
        start: &str,
    ) -> Result<Option<(Vec<String>, Vec<String>, String)>, AdapterError> {
        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        let mut page_token: Option<String> = None;
        let mut latest = start.to_string();

        for _ in 0..MAX_PAGES {
            let mut req = self
                .client
                .get(format!("{}/history", self.base_url))
                .bearer_auth(token)
                .query(&[("startHistoryId", start), ("maxResults", "100")]);
            if let Some(p) = &page_token {
                req = req.query(&[("pageToken", p.as_str())]);
            }
            let resp = req.send().await.map_err(|e| http::transport(PROVIDER, e))?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let page: HistoryPage = http::json(PROVIDER, resp).await?;
            if let Some(h) = page.history_id {
                latest = h;
            }
            let (c, d) = collect_history(page.history);
            changed.extend(c);
            deleted.extend(d);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        changed.retain(|id| !deleted.contains(id));
        changed.dedup();
        Ok(Some((changed, deleted, latest)))
    }
}

/// Message ids to refetch and ids deleted, in history order.
fn collect_history(records: Vec<HistoryRecord>) -> (Vec<String>, Vec<String>) {
    let mut changed: Vec<String> = Vec::new();
    let mut deleted: Vec<String> = Vec::new();
    for r in records {
        for m in r
            .messages_added
            .into_iter()
            .chain(r.labels_added)
            .chain(r.labels_removed)
        {
            if !changed.contains(&m.message.id) {
                changed.push(m.message.id);
            }
        }
        for m in r.messages_deleted {
            if !deleted.contains(&m.message.id) {
                deleted.push(m.message.id);
            }
        }
    }
    (changed, deleted)
}

fn header<'a>(msg: &'a GmailMessage, name: &str) -> Option<&'a str> {
    msg.payload
        .as_ref()?
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn fetch_changes(
        &self,
        secret: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchResult, AdapterError> {
        let (tokens, rotated_secret) = self.oauth.ensure_fresh(PROVIDER, secret, Utc::now()).await?;
        let token = tokens.access_token.as_str();

        let history = match cursor {
            Some(start) => self.history_pull(token, start).await?,
            None => None,
        };
        let (ids, removed, next) = match history {
            Some(v) => v,
            None => {
                if cursor.is_some() {
                    tracing::info!("gmail history id expired; starting a fresh pull");
                }
                let (ids, history_id) = self.initial_pull(token).await?;
                (ids, Vec::new(), history_id)
            }
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payload) = self.get_message(token, &id).await? {
                items.push(ProviderRawItem {
                    source_id: id,
                    payload,
                });
            }
        }

        Ok(FetchResult {
            items,
            removed,
            next_cursor: Some(next),
            rotated_secret,
        })
    }

    fn normalize(&self, raw: &ProviderRawItem) -> Result<NormalizedItem, AdapterError> {
        let msg: GmailMessage = serde_json::from_value(raw.payload.clone())
            .map_err(|e| AdapterError::Unknown(format!("gmail message {}: {e}", raw.source_id)))?;
        let timestamp = msg
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        let subject = header(&msg, "Subject")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("(no subject)")
            .to_string();
        let from = header(&msg, "From").map(str::to_string);
        // Archived or trashed mail has left the inbox.
        let handled = !msg.label_ids.iter().any(|l| l == "INBOX");

        NormalizedItem::new(
            PROVIDER,
            msg.id.clone(),
            subject,
            timestamp,
            ItemDetails::Email {
                from,
                snippet: msg.snippet.clone(),
            },
            raw.payload.clone(),
        )
        .map(|n| n.with_completed(handled))
        .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    async fn revoke(&self, secret: &serde_json::Value) -> Result<(), AdapterError> {
        self.oauth.revoke(PROVIDER, secret).await
    }
}
