//! Pinned targets: a user can pin a synced item or a triage row and get a
//! one-line summary back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{Due, ItemDetails, ItemKind, SyncedItem, TriageQueueItem, UserId};
use crate::store::{ItemStore, TriageQueueStore};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PinTarget {
    Task(String),
    Email(String),
    Event(String),
    /// A triage queue row.
    Context(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSummary {
    pub title: String,
    pub subtitle: Option<String>,
}

impl fmt::Display for PinTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinTarget::Task(id) => write!(f, "task:{id}"),
            PinTarget::Email(id) => write!(f, "email:{id}"),
            PinTarget::Event(id) => write!(f, "event:{id}"),
            PinTarget::Context(id) => write!(f, "context:{id}"),
        }
    }
}

impl FromStr for PinTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("pin target '{s}' is not kind:id")))?;
        if id.is_empty() {
            return Err(Error::InvalidInput(format!("pin target '{s}' has no id")));
        }
        match kind {
            "task" => Ok(PinTarget::Task(id.to_string())),
            "email" => Ok(PinTarget::Email(id.to_string())),
            "event" => Ok(PinTarget::Event(id.to_string())),
            "context" => Uuid::parse_str(id)
                .map(PinTarget::Context)
                .map_err(|e| Error::InvalidInput(format!("context id: {e}"))),
            other => Err(Error::InvalidInput(format!("unknown pin kind '{other}'"))),
        }
    }
}

impl PinTarget {
    #[tracing::instrument(level = "debug", skip(items, queue))]
    pub async fn resolve(
        &self,
        user_id: UserId,
        items: &dyn ItemStore,
        queue: &dyn TriageQueueStore,
    ) -> Result<PinSummary> {
        let (kind, id) = match self {
            PinTarget::Context(id) => {
                let row = queue
                    .get_queue_item(user_id, *id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("triage item {id}")))?;
                return Ok(context_summary(&row));
            }
            PinTarget::Task(id) => (ItemKind::Task, id),
            PinTarget::Email(id) => (ItemKind::Email, id),
            PinTarget::Event(id) => (ItemKind::Event, id),
        };
        let found = items
            .find_item_by_kind(user_id, kind, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pinned {self}")))?;
        Ok(item_summary(&found))
    }
}

fn item_summary(synced: &SyncedItem) -> PinSummary {
    let subtitle = match &synced.item.details {
        ItemDetails::Task { due, .. } => due.map(|d| match d {
            Due::Date(day) => format!("due {day}"),
            Due::At(at) => format!("due {}", at.format("%Y-%m-%d %H:%M UTC")),
        }),
        ItemDetails::Email { from, .. } => from.as_ref().map(|f| format!("from {f}")),
        ItemDetails::Event { start, all_day, .. } => Some(if *all_day {
            start.format("%Y-%m-%d (all day)").to_string()
        } else {
            start.format("%Y-%m-%d %H:%M UTC").to_string()
        }),
        ItemDetails::Transaction { amount, currency, .. } => Some(format!(
            "{amount:.2} {}",
            currency.as_deref().unwrap_or("USD")
        )),
    };
    let title = if synced.item.completed {
        format!("{} (done)", synced.item.title)
    } else {
        synced.item.title.clone()
    };
    PinSummary { title, subtitle }
}

fn context_summary(row: &TriageQueueItem) -> PinSummary {
    PinSummary {
        title: row.title.clone(),
        subtitle: Some(format!("score {} ({})", row.score, row.status.as_str())),
    }
}
