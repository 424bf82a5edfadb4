//! Google Calendar adapter.
//!
//! Uses the events `syncToken` for incremental pulls. An expired token
//! (HTTP 410) triggers a fresh windowed pull.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sundial_core::sync::{FetchResult, ProviderRawItem};
use sundial_core::{AdapterError, ItemDetails, NormalizedItem, ProviderAdapter};
use tracing::instrument;

use super::oauth::GoogleOAuth;
use crate::http;

pub const PROVIDER: &str = "google_calendar";
const DEFAULT_BASE: &str = "https://www.googleapis.com/calendar/v3";
const MAX_PAGES: usize = 10;
/// Initial pulls start this far back.
const INITIAL_LOOKBACK_DAYS: i64 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CalendarEvent {
    id: String,
    summary: Option<String>,
    status: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
    updated: Option<String>,
    created: Option<String>,
}

enum PullError {
    SyncTokenExpired,
    Adapter(AdapterError),
}

impl From<AdapterError> for PullError {
    fn from(e: AdapterError) -> Self {
        PullError::Adapter(e)
    }
}

#[derive(Clone)]
pub struct GoogleCalendarAdapter {
    client: Client,
    oauth: GoogleOAuth,
    base_url: String,
    calendar_id: String,
}

impl GoogleCalendarAdapter {
    pub fn new(client: Client, oauth: GoogleOAuth) -> Self {
        Self {
            client,
            oauth,
            base_url: DEFAULT_BASE.to_string(),
            calendar_id: "primary".to_string(),
        }
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    async fn pull(
        &self,
        token: &str,
        sync_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<serde_json::Value>, Option<String>), PullError> {
        let url = format!("{}/calendars/{}/events", self.base_url, self.calendar_id);
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut next_sync = None;

        for _ in 0..MAX_PAGES {
            let mut req = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&[("singleEvents", "true"), ("showDeleted", "true"), ("maxResults", "250")]);
            req = match sync_token {
                Some(t) => req.query(&[("syncToken", t)]),
                None => req.query(&[(
                    "timeMin",
                    (now - Duration::days(INITIAL_LOOKBACK_DAYS)).to_rfc3339(),
                )]),
            };
            if let Some(p) = &page_token {
                req = req.query(&[("pageToken", p.as_str())]);
            }

            let resp = req.send().await.map_err(|e| http::transport(PROVIDER, e))?;
            if resp.status() == StatusCode::GONE {
                return Err(PullError::SyncTokenExpired);
            }
            let page: EventsPage = http::json(PROVIDER, resp).await?;
            events.extend(page.items);
            next_sync = page.next_sync_token.or(next_sync);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok((events, next_sync))
    }
}

fn parse_rfc3339(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

/// `(instant, all_day)`; all-day dates are pinned to UTC midnight.
fn parse_event_time(t: &EventTime) -> Option<(DateTime<Utc>, bool)> {
    if let Some(at) = parse_rfc3339(t.date_time.as_deref()) {
        return Some((at, false));
    }
    let day = NaiveDate::parse_from_str(t.date.as_deref()?, "%Y-%m-%d").ok()?;
    Some((day.and_hms_opt(0, 0, 0)?.and_utc(), true))
}

fn split_events(events: Vec<serde_json::Value>) -> (Vec<ProviderRawItem>, Vec<String>) {
    let mut items = Vec::new();
    let mut removed = Vec::new();
    for payload in events {
        let Some(id) = payload.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
            continue;
        };
        if payload.get("status").and_then(|v| v.as_str()) == Some("cancelled") {
            removed.push(id);
        } else {
            items.push(ProviderRawItem {
                source_id: id,
                payload,
            });
        }
    }
    (items, removed)
}

#[async_trait]
impl ProviderAdapter for GoogleCalendarAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn fetch_changes(
        &self,
        secret: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchResult, AdapterError> {
        let now = Utc::now();
        let (tokens, rotated_secret) = self.oauth.ensure_fresh(PROVIDER, secret, now).await?;

        let (events, next_sync) = match self.pull(&tokens.access_token, cursor, now).await {
            Ok(v) => v,
            Err(PullError::SyncTokenExpired) => {
                tracing::info!("calendar sync token expired; starting a fresh pull");
                match self.pull(&tokens.access_token, None, now).await {
                    Ok(v) => v,
                    Err(PullError::Adapter(e)) => return Err(e),
                    Err(PullError::SyncTokenExpired) => {
                        return Err(AdapterError::Unknown(
                            "calendar rejected a fresh pull as expired".to_string(),
                        ));
                    }
                }
            }
            Err(PullError::Adapter(e)) => return Err(e),
        };

        let (items, removed) = split_events(events);
        Ok(FetchResult {
            items,
            removed,
            next_cursor: next_sync,
            rotated_secret,
        })
    }

    fn normalize(&self, raw: &ProviderRawItem) -> Result<NormalizedItem, AdapterError> {
        let ev: CalendarEvent = serde_json::from_value(raw.payload.clone())
            .map_err(|e| AdapterError::Unknown(format!("calendar event {}: {e}", raw.source_id)))?;
        let (start, all_day) = ev
            .start
            .as_ref()
            .and_then(parse_event_time)
            .ok_or_else(|| AdapterError::Unknown(format!("calendar event {} has no start", ev.id)))?;
        let end = ev.end.as_ref().and_then(parse_event_time).map(|(t, _)| t);
        let updated = parse_rfc3339(ev.updated.as_deref());

        NormalizedItem::new(
            PROVIDER,
            ev.id,
            ev.summary.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "(no title)".to_string()),
            parse_rfc3339(ev.created.as_deref()).unwrap_or(start),
            ItemDetails::Event { start, end, all_day },
            raw.payload.clone(),
        )
        .map(|n| {
            n.with_completed(ev.status.as_deref() == Some("cancelled"))
                .with_remote_updated_at(updated)
        })
        .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    async fn revoke(&self, secret: &serde_json::Value) -> Result<(), AdapterError> {
        self.oauth.revoke(PROVIDER, secret).await
    }
}
