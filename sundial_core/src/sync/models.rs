use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::traits::AdapterError;
use crate::Error;
use crate::models::UserId;
use crate::triage::TriageOutcome;
use crate::vault::CryptoError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthExpired,
    ScopeMissing,
    RateLimited,
    Timeout,
    /// The stored credential could not be decrypted; the user must reconnect.
    CredentialUnreadable,
    Storage,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(e: Error) -> Self {
        Self::new(FailureKind::Storage, e.to_string())
    }
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<AdapterError> for SyncFailure {
    fn from(e: AdapterError) -> Self {
        let kind = match &e {
            AdapterError::AuthExpired(_) => FailureKind::AuthExpired,
            AdapterError::ScopeMissing(_) => FailureKind::ScopeMissing,
            AdapterError::RateLimited { .. } => FailureKind::RateLimited,
            AdapterError::Unknown(_) => FailureKind::Unknown,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<Error> for SyncFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::Crypto(CryptoError::AuthenticationFailed) => Self::new(
                FailureKind::CredentialUnreadable,
                "stored credential is unreadable; reconnect needed",
            ),
            Error::RateLimited(r) => Self::new(FailureKind::RateLimited, r.to_string()),
            other => Self::storage(other),
        }
    }
}

/// Per-adapter result inside one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterOutcome {
    pub items_synced: usize,
    #[serde(default)]
    pub items_removed: usize,
    /// Deltas older than the stored watermark.
    #[serde(default)]
    pub items_stale: usize,
    /// Raw records the adapter could not normalize.
    #[serde(default)]
    pub items_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncFailure>,
}

impl AdapterOutcome {
    pub fn failed(failure: SyncFailure) -> Self {
        Self {
            error: Some(failure),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One user's sync pass across every linked adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub adapters: BTreeMap<String, AdapterOutcome>,
    /// Registered adapters the user has not linked.
    pub skipped: Vec<String>,
    pub triage: TriageOutcome,
    /// Set only when the run could not start (e.g. credential listing failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncRun {
    pub fn failed_to_start(user_id: UserId, started_at: DateTime<Utc>, error: String) -> Self {
        Self {
            user_id,
            started_at,
            finished_at: Utc::now(),
            adapters: BTreeMap::new(),
            skipped: Vec::new(),
            triage: TriageOutcome::default(),
            error: Some(error),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &SyncFailure)> {
        self.adapters
            .iter()
            .filter_map(|(p, o)| o.error.as_ref().map(|e| (p.as_str(), e)))
    }
}

/// Response shape for a single-provider sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSyncResult {
    pub synced: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub triage: TriageOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectOutcome {
    pub provider: String,
    pub removed: bool,
    pub remote_revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_error: Option<String>,
}
