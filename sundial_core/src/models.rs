use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Owner of credentials, synced items and queue entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s.trim()).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Task,
    Event,
    Email,
    Transaction,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Task => "task",
            ItemKind::Event => "event",
            ItemKind::Email => "email",
            ItemKind::Transaction => "transaction",
        }
    }
}

impl FromStr for ItemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task" => Ok(ItemKind::Task),
            "event" => Ok(ItemKind::Event),
            "email" => Ok(ItemKind::Email),
            "transaction" => Ok(ItemKind::Transaction),
            other => Err(Error::InvalidInput(format!("unknown item kind '{other}'"))),
        }
    }
}

/// Task priority, lowest to highest.
///
/// Todoist encodes priority as 1 (normal) .. 4 (urgent); `from_todoist` follows that scale.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Lowest,
    Low,
    High,
    Highest,
}

impl TaskPriority {
    pub fn from_todoist(priority: u8) -> Self {
        match priority {
            4.. => TaskPriority::Highest,
            3 => TaskPriority::High,
            2 => TaskPriority::Low,
            _ => TaskPriority::Lowest,
        }
    }
}

/// A task due date: either a calendar day or an exact instant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Due {
    Date(NaiveDate),
    At(DateTime<Utc>),
}

/// Structured attributes the deterministic scoring rules consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetails {
    Task {
        priority: TaskPriority,
        due: Option<Due>,
    },
    Event {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        all_day: bool,
    },
    Email {
        from: Option<String>,
        snippet: Option<String>,
    },
    Transaction {
        /// Positive values are money leaving the account.
        amount: f64,
        currency: Option<String>,
        pending: bool,
        merchant: Option<String>,
    },
}

impl ItemDetails {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemDetails::Task { .. } => ItemKind::Task,
            ItemDetails::Event { .. } => ItemKind::Event,
            ItemDetails::Email { .. } => ItemKind::Email,
            ItemDetails::Transaction { .. } => ItemKind::Transaction,
        }
    }
}

/// The common shape every adapter produces before scoring.
///
/// `(source_provider, source_id)` is the natural key used for idempotent upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub source_provider: String,
    pub source_id: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub details: ItemDetails,
    pub raw_metadata: serde_json::Value,
    /// Remote object is done, deleted or otherwise no longer actionable.
    #[serde(default)]
    pub completed: bool,
    /// Provider-side modification watermark; older deltas never overwrite newer state.
    #[serde(default)]
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl NormalizedItem {
    #[tracing::instrument(level = "debug", skip(details, raw_metadata))]
    pub fn new(
        source_provider: impl Into<String> + fmt::Debug,
        source_id: impl Into<String> + fmt::Debug,
        title: impl Into<String> + fmt::Debug,
        timestamp: DateTime<Utc>,
        details: ItemDetails,
        raw_metadata: serde_json::Value,
    ) -> Result<Self> {
        let source_provider = source_provider.into();
        if source_provider.trim().is_empty() {
            return Err(Error::InvalidInput("source_provider is empty".to_string()));
        }
        let source_id = source_id.into();
        if source_id.trim().is_empty() {
            return Err(Error::InvalidInput("source_id is empty".to_string()));
        }
        Ok(Self {
            source_provider,
            source_id,
            title: title.into(),
            timestamp,
            details,
            raw_metadata,
            completed: false,
            remote_updated_at: None,
        })
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    pub fn with_remote_updated_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.remote_updated_at = at;
        self
    }

    pub fn kind(&self) -> ItemKind {
        self.details.kind()
    }
}

/// A normalized item as reconciled into the local store for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedItem {
    pub user_id: UserId,
    pub item: NormalizedItem,
    pub needs_scoring: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    Pending,
    Approved,
    Dismissed,
    PushedToContext,
}

impl TriageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageStatus::Pending => "pending",
            TriageStatus::Approved => "approved",
            TriageStatus::Dismissed => "dismissed",
            TriageStatus::PushedToContext => "pushed_to_context",
        }
    }

    /// Terminal statuses are user decisions; automated rescoring never rewrites them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TriageStatus::Pending)
    }

    /// Whether a user action may move an item from `self` to `to`.
    pub fn can_transition_to(&self, to: TriageStatus) -> bool {
        matches!(
            (self, to),
            (
                TriageStatus::Pending,
                TriageStatus::Approved | TriageStatus::Dismissed | TriageStatus::PushedToContext
            ) | (TriageStatus::Approved, TriageStatus::PushedToContext)
        )
    }
}

impl FromStr for TriageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pending" => Ok(TriageStatus::Pending),
            "approved" => Ok(TriageStatus::Approved),
            "dismissed" => Ok(TriageStatus::Dismissed),
            "pushed_to_context" => Ok(TriageStatus::PushedToContext),
            other => Err(Error::InvalidInput(format!(
                "unknown triage status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageQueueItem {
    pub id: Uuid,
    pub user_id: UserId,
    pub source_provider: String,
    pub source_id: String,
    pub title: String,
    pub score: u8,
    pub reasoning: String,
    pub status: TriageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl TriageQueueItem {
    /// A fresh `Pending` entry for a scored item.
    pub fn pending(
        user_id: UserId,
        item: &NormalizedItem,
        score: u8,
        reasoning: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            source_provider: item.source_provider.clone(),
            source_id: item.source_id.clone(),
            title: item.title.clone(),
            score: score.min(100),
            reasoning: reasoning.into(),
            status: TriageStatus::Pending,
            created_at: now,
            updated_at: now,
            remote_updated_at: item.remote_updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todoist_priority_scale_maps_four_to_highest() {
        assert_eq!(TaskPriority::from_todoist(4), TaskPriority::Highest);
        assert_eq!(TaskPriority::from_todoist(3), TaskPriority::High);
        assert_eq!(TaskPriority::from_todoist(2), TaskPriority::Low);
        assert_eq!(TaskPriority::from_todoist(1), TaskPriority::Lowest);
        assert_eq!(TaskPriority::from_todoist(0), TaskPriority::Lowest);
    }

    #[test]
    fn terminal_statuses_only_move_forward() {
        assert!(TriageStatus::Pending.can_transition_to(TriageStatus::Dismissed));
        assert!(TriageStatus::Approved.can_transition_to(TriageStatus::PushedToContext));
        assert!(!TriageStatus::Dismissed.can_transition_to(TriageStatus::Pending));
        assert!(!TriageStatus::Dismissed.can_transition_to(TriageStatus::Approved));
        assert!(!TriageStatus::Pending.can_transition_to(TriageStatus::Pending));
    }

    #[test]
    fn normalized_item_rejects_empty_natural_key() {
        let details = ItemDetails::Email {
            from: None,
            snippet: None,
        };
        let err = NormalizedItem::new(
            "gmail",
            " ",
            "hi",
            Utc::now(),
            details,
            serde_json::json!({}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
