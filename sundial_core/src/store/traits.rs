use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::models::{ItemKind, NormalizedItem, SyncedItem, TriageQueueItem, TriageStatus, UserId};
use crate::vault::Credential;

/// Result of a natural-key upsert that honours the remote watermark.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The stored row carries a newer `remote_updated_at`; nothing was written.
    Stale,
}

/// Result of merging a scored item into the queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Written,
    /// An existing row is terminal or newer; left untouched.
    Preserved,
}

/// A scored item whose queue row is still `Pending`, with that row's current verdict.
#[derive(Debug, Clone)]
pub struct RescoreCandidate {
    pub item: SyncedItem,
    pub score: u8,
    pub reasoning: String,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn upsert_credential(&self, credential: &Credential) -> Result<()>;

    async fn get_credential(&self, owner_id: UserId, provider: &str) -> Result<Option<Credential>>;

    /// Returns whether a row was removed.
    async fn delete_credential(&self, owner_id: UserId, provider: &str) -> Result<bool>;

    async fn list_credentials(&self, owner_id: UserId) -> Result<Vec<Credential>>;

    async fn find_credential_owner(
        &self,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<UserId>>;

    /// Every user holding at least one credential, for cron-wide sync.
    async fn list_credential_owners(&self) -> Result<Vec<UserId>>;
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or update on `(user_id, source_provider, source_id)` and flag the
    /// row for scoring. Older watermarks lose.
    async fn upsert_item(
        &self,
        user_id: UserId,
        item: &NormalizedItem,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    async fn get_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<Option<SyncedItem>>;

    async fn list_items_by_kind(&self, user_id: UserId, kind: ItemKind) -> Result<Vec<SyncedItem>>;

    /// Lookup by kind and provider-side id, for callers that do not know the provider.
    async fn find_item_by_kind(
        &self,
        user_id: UserId,
        kind: ItemKind,
        source_id: &str,
    ) -> Result<Option<SyncedItem>>;

    async fn list_items_needing_scoring(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncedItem>>;

    /// Open tasks and events that are already scored and still `Pending` in the
    /// queue. Their rule scores move with the clock.
    async fn list_time_sensitive_pending(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<RescoreCandidate>>;

    /// Clears `needs_scoring` only if the row was not rewritten since `seen_updated_at`.
    async fn mark_scored(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Marks a remotely deleted item completed so the next scoring pass retracts it.
    async fn retract_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_cursor(&self, user_id: UserId, provider: &str) -> Result<Option<String>>;

    async fn save_cursor(
        &self,
        user_id: UserId,
        provider: &str,
        cursor: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait TriageQueueStore: Send + Sync {
    /// Atomic upsert that only touches existing rows still `Pending`.
    async fn merge_scored(&self, entry: &TriageQueueItem) -> Result<MergeOutcome>;

    async fn get_queue_item(&self, user_id: UserId, id: Uuid) -> Result<Option<TriageQueueItem>>;

    async fn find_queue_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<Option<TriageQueueItem>>;

    /// Ordered by score desc then recency desc.
    async fn list_queue(
        &self,
        user_id: UserId,
        status: Option<TriageStatus>,
        limit: usize,
    ) -> Result<Vec<TriageQueueItem>>;

    /// Compare-and-set on status. Returns false when the row was not in `from`.
    async fn set_status(
        &self,
        user_id: UserId,
        id: Uuid,
        from: TriageStatus,
        to: TriageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops a still-pending row. Terminal rows stay.
    async fn remove_pending(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<bool>;
}
