//! Plaid adapter.
//!
//! Transactions come from `/transactions/sync` with its opaque cursor.
//! Webhooks only announce that updates exist, so every relevant delivery
//! triggers a resync. Deliveries are signed with ES256 keys served by
//! `/webhook_verification_key/get`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jsonwebtoken::jwk::Jwk;
use reqwest::Client;
use serde::Deserialize;
use sundial_core::sync::{FetchResult, ProviderRawItem, RevokePolicy, WebhookDelta, WebhookDescriptor};
use sundial_core::webhooks::{KeyFetcher, VerificationError, VerifiedEvent};
use sundial_core::{AdapterError, ItemDetails, NormalizedItem, ProviderAdapter};
use tracing::instrument;

use crate::http;

pub const PROVIDER: &str = "plaid";
/// Header carrying the signed verification token.
pub const WEBHOOK_HEADER: &str = "plaid-verification";
const PAGE_SIZE: u32 = 500;
const MAX_PAGES: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaidEnv {
    Sandbox,
    Development,
    Production,
}

impl PlaidEnv {
    pub fn base_url(&self) -> &'static str {
        match self {
            PlaidEnv::Sandbox => "https://sandbox.plaid.com",
            PlaidEnv::Development => "https://development.plaid.com",
            PlaidEnv::Production => "https://production.plaid.com",
        }
    }
}

impl std::str::FromStr for PlaidEnv {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(PlaidEnv::Sandbox),
            "development" => Ok(PlaidEnv::Development),
            "production" => Ok(PlaidEnv::Production),
            other => Err(AdapterError::Unknown(format!("unknown plaid env '{other}'"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncPage {
    #[serde(default)]
    added: Vec<serde_json::Value>,
    #[serde(default)]
    modified: Vec<serde_json::Value>,
    #[serde(default)]
    removed: Vec<RemovedTransaction>,
    next_cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RemovedTransaction {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct PlaidTransaction {
    transaction_id: String,
    amount: f64,
    iso_currency_code: Option<String>,
    unofficial_currency_code: Option<String>,
    date: String,
    datetime: Option<String>,
    authorized_datetime: Option<String>,
    name: Option<String>,
    merchant_name: Option<String>,
    #[serde(default)]
    pending: bool,
}

#[derive(Debug, Deserialize)]
struct PlaidErrorBody {
    error_type: String,
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
struct VerificationKeyResponse {
    key: Jwk,
}

/// Shared request plumbing for the adapter and the key fetcher.
#[derive(Clone)]
struct PlaidClient {
    client: Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl PlaidClient {
    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        mut body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        body["client_id"] = serde_json::Value::String(self.client_id.clone());
        body["secret"] = serde_json::Value::String(self.secret.clone());
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport(PROVIDER, e))?;
        if resp.status().is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| AdapterError::Unknown(format!("plaid {path} decode: {e}")));
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<PlaidErrorBody>(&text) {
            Ok(err) => Err(map_plaid_error(&err)),
            Err(_) => Err(http::classify_status(PROVIDER, status, None, &text)),
        }
    }
}

/// Plaid reports most failures as HTTP 400 with a typed body.
fn map_plaid_error(e: &PlaidErrorBody) -> AdapterError {
    let message = format!("{}: {}", e.error_code, e.error_message);
    match (e.error_type.as_str(), e.error_code.as_str()) {
        (_, "ITEM_LOGIN_REQUIRED" | "INVALID_ACCESS_TOKEN" | "ITEM_NOT_FOUND") => {
            AdapterError::AuthExpired(message)
        }
        (_, "INSUFFICIENT_CREDENTIALS" | "PRODUCTS_NOT_SUPPORTED" | "ADDITIONAL_CONSENT_REQUIRED") => {
            AdapterError::ScopeMissing(message)
        }
        ("RATE_LIMIT_EXCEEDED", _) => AdapterError::RateLimited {
            retry_after: None,
            message,
        },
        _ => AdapterError::Unknown(message),
    }
}

#[derive(Clone)]
pub struct PlaidAdapter {
    api: PlaidClient,
}

impl PlaidAdapter {
    pub fn new(
        env: PlaidEnv,
        client_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            api: PlaidClient {
                client: http::client(http::DEFAULT_TIMEOUT)?,
                base_url: env.base_url().to_string(),
                client_id: client_id.into(),
                secret: secret.into(),
            },
        })
    }

    /// Key fetcher for the signed-claims webhook verifier, sharing this client.
    pub fn key_fetcher(&self) -> PlaidKeyFetcher {
        PlaidKeyFetcher {
            api: self.api.clone(),
        }
    }
}

fn parse_rfc3339(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn raw_items(txns: Vec<serde_json::Value>) -> Vec<ProviderRawItem> {
    txns.into_iter()
        .filter_map(|payload| {
            let id = payload.get("transaction_id")?.as_str()?.to_string();
            Some(ProviderRawItem {
                source_id: id,
                payload,
            })
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for PlaidAdapter {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn fetch_changes(
        &self,
        secret: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchResult, AdapterError> {
        let access_token = http::access_token(PROVIDER, secret)?;
        let mut cursor = cursor.map(str::to_string);
        let mut out = FetchResult::default();

        for _ in 0..MAX_PAGES {
            let mut body = serde_json::json!({
                "access_token": access_token,
                "count": PAGE_SIZE,
            });
            if let Some(c) = &cursor {
                body["cursor"] = serde_json::Value::String(c.clone());
            }
            let page: SyncPage = self.api.post("/transactions/sync", body).await?;
            out.items.extend(raw_items(page.added));
            out.items.extend(raw_items(page.modified));
            out.removed
                .extend(page.removed.into_iter().map(|r| r.transaction_id));
            cursor = Some(page.next_cursor);
            if !page.has_more {
                break;
            }
        }
        out.next_cursor = cursor;
        Ok(out)
    }

    fn normalize(&self, raw: &ProviderRawItem) -> Result<NormalizedItem, AdapterError> {
        let tx: PlaidTransaction = serde_json::from_value(raw.payload.clone())
            .map_err(|e| AdapterError::Unknown(format!("plaid transaction {}: {e}", raw.source_id)))?;
        let day = NaiveDate::parse_from_str(&tx.date, "%Y-%m-%d")
            .map_err(|e| AdapterError::Unknown(format!("plaid date '{}': {e}", tx.date)))?;
        let timestamp = parse_rfc3339(tx.datetime.as_deref())
            .or_else(|| parse_rfc3339(tx.authorized_datetime.as_deref()))
            .or_else(|| day.and_hms_opt(0, 0, 0).map(|d| d.and_utc()))
            .unwrap_or_else(Utc::now);
        let title = tx
            .merchant_name
            .clone()
            .or(tx.name.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "Transaction".to_string());

        NormalizedItem::new(
            PROVIDER,
            tx.transaction_id,
            title,
            timestamp,
            ItemDetails::Transaction {
                amount: tx.amount,
                currency: tx.iso_currency_code.or(tx.unofficial_currency_code),
                pending: tx.pending,
                merchant: tx.merchant_name,
            },
            raw.payload.clone(),
        )
        .map_err(|e| AdapterError::Unknown(e.to_string()))
    }

    fn describe_webhook(&self, payload: &serde_json::Value) -> WebhookDescriptor {
        let field = |k: &str| payload.get(k).and_then(|v| v.as_str()).unwrap_or_default();
        WebhookDescriptor {
            event_name: format!("{}:{}", field("webhook_type"), field("webhook_code")),
            account_id: payload
                .get("item_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    fn interpret_webhook(&self, event: &VerifiedEvent) -> Result<WebhookDelta, AdapterError> {
        match event.event_name.as_str() {
            "TRANSACTIONS:SYNC_UPDATES_AVAILABLE"
            | "TRANSACTIONS:DEFAULT_UPDATE"
            | "TRANSACTIONS:INITIAL_UPDATE"
            | "TRANSACTIONS:HISTORICAL_UPDATE"
            | "TRANSACTIONS:TRANSACTIONS_REMOVED" => Ok(WebhookDelta::Resync),
            _ => Ok(WebhookDelta::Ignore),
        }
    }

    /// Linked bank items keep billing until removed at Plaid.
    fn revoke_policy(&self) -> RevokePolicy {
        RevokePolicy::MustSucceed
    }

    #[instrument(level = "info", skip(self, secret))]
    async fn revoke(&self, secret: &serde_json::Value) -> Result<(), AdapterError> {
        let access_token = http::access_token(PROVIDER, secret)?;
        let _: serde_json::Value = self
            .api
            .post("/item/remove", serde_json::json!({ "access_token": access_token }))
            .await?;
        Ok(())
    }
}

/// Fetches Plaid's webhook signing keys by `kid`.
#[derive(Clone)]
pub struct PlaidKeyFetcher {
    api: PlaidClient,
}

#[async_trait]
impl KeyFetcher for PlaidKeyFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch_key(&self, kid: &str) -> Result<Jwk, VerificationError> {
        let resp: VerificationKeyResponse = self
            .api
            .post(
                "/webhook_verification_key/get",
                serde_json::json!({ "key_id": kid }),
            )
            .await
            .map_err(|e| VerificationError::KeyFetchFailed(e.to_string()))?;
        Ok(resp.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn adapter() -> PlaidAdapter {
        PlaidAdapter::new(PlaidEnv::Sandbox, "cid", "sec").unwrap()
    }

    #[test]
    fn normalizes_transaction() {
        let item = adapter()
            .normalize(&ProviderRawItem {
                source_id: "tx1".into(),
                payload: serde_json::json!({
                    "transaction_id": "tx1",
                    "account_id": "acc",
                    "amount": 1200.5,
                    "iso_currency_code": "USD",
                    "unofficial_currency_code": null,
                    "date": "2026-03-01",
                    "datetime": null,
                    "authorized_datetime": null,
                    "name": "LANDLORD LLC ACH",
                    "merchant_name": null,
                    "pending": true
                }),
            })
            .unwrap();
        assert_eq!(item.title, "LANDLORD LLC ACH");
        assert_eq!(item.timestamp, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(
            item.details,
            ItemDetails::Transaction {
                amount: 1200.5,
                currency: Some("USD".into()),
                pending: true,
                merchant: None,
            }
        );
        assert!(item.remote_updated_at.is_none());
    }

    #[test]
    fn bad_date_is_rejected() {
        let err = adapter()
            .normalize(&ProviderRawItem {
                source_id: "tx2".into(),
                payload: serde_json::json!({"transaction_id": "tx2", "amount": 1.0, "date": "03/01/2026"}),
            })
            .unwrap_err();
        assert!(matches!(err, AdapterError::Unknown(_)));
    }

    #[test]
    fn webhooks_trigger_resync_for_the_item() {
        let a = adapter();
        let payload = serde_json::json!({
            "webhook_type": "TRANSACTIONS",
            "webhook_code": "SYNC_UPDATES_AVAILABLE",
            "item_id": "item-9",
            "initial_update_complete": true
        });
        let d = a.describe_webhook(&payload);
        assert_eq!(d.event_name, "TRANSACTIONS:SYNC_UPDATES_AVAILABLE");
        assert_eq!(d.account_id.as_deref(), Some("item-9"));

        let event = VerifiedEvent {
            provider: PROVIDER.into(),
            event_name: d.event_name,
            payload,
            verified_at: Utc::now(),
            key_id: Some("kid".into()),
        };
        assert_eq!(a.interpret_webhook(&event).unwrap(), WebhookDelta::Resync);

        let other = VerifiedEvent {
            event_name: "ITEM:PENDING_EXPIRATION".into(),
            ..event
        };
        assert_eq!(a.interpret_webhook(&other).unwrap(), WebhookDelta::Ignore);
        assert_eq!(a.revoke_policy(), RevokePolicy::MustSucceed);
    }

    #[test]
    fn error_bodies_map_to_taxonomy() {
        let e = |t: &str, c: &str| PlaidErrorBody {
            error_type: t.into(),
            error_code: c.into(),
            error_message: String::new(),
        };
        assert!(matches!(
            map_plaid_error(&e("ITEM_ERROR", "ITEM_LOGIN_REQUIRED")),
            AdapterError::AuthExpired(_)
        ));
        assert!(matches!(
            map_plaid_error(&e("RATE_LIMIT_EXCEEDED", "TRANSACTIONS_LIMIT")),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            map_plaid_error(&e("API_ERROR", "INTERNAL_SERVER_ERROR")),
            AdapterError::Unknown(_)
        ));
        assert_eq!("production".parse::<PlaidEnv>().unwrap(), PlaidEnv::Production);
        assert!("staging".parse::<PlaidEnv>().is_err());
    }
}
