//! SQLite-backed store for credentials, synced items, cursors, the triage queue
//! and rate limit counters. Single WAL-mode file.
//!
//! Usage:
//! ```ignore
//! let store = SqliteStore::new("/var/lib/sundial/sundial.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{
    ItemDetails, ItemKind, NormalizedItem, SyncedItem, TriageQueueItem, TriageStatus, UserId,
};
use crate::ratelimit::{CounterStore, WindowKey};
use crate::store::traits::{
    CredentialStore, ItemStore, MergeOutcome, RescoreCandidate, TriageQueueStore, UpsertOutcome,
};
use crate::vault::Credential;
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::backend("sqlite_store", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;

        Self::migrate(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_store", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store_migration", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    owner_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    ciphertext BLOB NOT NULL,
    nonce BLOB NOT NULL,
    auth_tag BLOB NOT NULL,
    rotated_at TEXT NOT NULL,
    external_account_id TEXT,
    PRIMARY KEY (owner_id, provider)
);

DROP INDEX IF EXISTS credentials_account_idx;

CREATE UNIQUE INDEX IF NOT EXISTS credentials_account_uniq
    ON credentials(provider, external_account_id)
    WHERE external_account_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS synced_items (
    user_id TEXT NOT NULL,
    source_provider TEXT NOT NULL,
    source_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    item_timestamp TEXT NOT NULL,
    details TEXT NOT NULL,
    raw_metadata TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    remote_updated_at TEXT,
    needs_scoring INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, source_provider, source_id)
);

CREATE INDEX IF NOT EXISTS synced_items_scoring_idx
    ON synced_items(user_id, needs_scoring);

CREATE INDEX IF NOT EXISTS synced_items_kind_idx
    ON synced_items(user_id, kind, source_id);

CREATE TABLE IF NOT EXISTS sync_cursors (
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    cursor TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, provider)
);

CREATE TABLE IF NOT EXISTS triage_queue (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    source_provider TEXT NOT NULL,
    source_id TEXT NOT NULL,
    title TEXT NOT NULL,
    score INTEGER NOT NULL,
    reasoning TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    remote_updated_at TEXT,
    UNIQUE (user_id, source_provider, source_id)
);

CREATE INDEX IF NOT EXISTS triage_queue_read_idx
    ON triage_queue(user_id, status, score DESC, created_at DESC);

CREATE TABLE IF NOT EXISTS rate_limit_counters (
    limiter_name TEXT NOT NULL,
    identity TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (limiter_name, identity, window_start)
);
"#;

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite_store", e)
}

/// Fixed-width UTC text so that string comparison orders like time.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

fn parse_user_id(s: &str) -> UserId {
    UserId(Uuid::parse_str(s).unwrap_or(Uuid::nil()))
}

fn row_to_credential(r: &SqliteRow) -> Credential {
    Credential {
        owner_id: parse_user_id(&r.get::<String, _>("owner_id")),
        provider: r.get("provider"),
        ciphertext: r.get("ciphertext"),
        nonce: r.get("nonce"),
        auth_tag: r.get("auth_tag"),
        rotated_at: parse_dt(&r.get::<String, _>("rotated_at")),
        external_account_id: r.get("external_account_id"),
    }
}

fn row_to_synced_item(r: &SqliteRow) -> Result<SyncedItem> {
    let details: ItemDetails = serde_json::from_str(&r.get::<String, _>("details"))
        .map_err(|e| Error::backend("decode synced item details", e))?;
    let raw_metadata: serde_json::Value =
        serde_json::from_str(&r.get::<String, _>("raw_metadata")).unwrap_or_default();
    let item = NormalizedItem {
        source_provider: r.get("source_provider"),
        source_id: r.get("source_id"),
        title: r.get("title"),
        timestamp: parse_dt(&r.get::<String, _>("item_timestamp")),
        details,
        raw_metadata,
        completed: r.get("completed"),
        remote_updated_at: r
            .get::<Option<String>, _>("remote_updated_at")
            .map(|s| parse_dt(&s)),
    };
    Ok(SyncedItem {
        user_id: parse_user_id(&r.get::<String, _>("user_id")),
        item,
        needs_scoring: r.get("needs_scoring"),
        created_at: parse_dt(&r.get::<String, _>("created_at")),
        updated_at: parse_dt(&r.get::<String, _>("updated_at")),
    })
}

fn row_to_queue_item(r: &SqliteRow) -> Result<TriageQueueItem> {
    let id: String = r.get("id");
    let status: String = r.get("status");
    let score: i64 = r.get("score");
    Ok(TriageQueueItem {
        id: Uuid::parse_str(&id).map_err(|e| Error::backend("decode triage queue id", e))?,
        user_id: parse_user_id(&r.get::<String, _>("user_id")),
        source_provider: r.get("source_provider"),
        source_id: r.get("source_id"),
        title: r.get("title"),
        score: score.clamp(0, 100) as u8,
        reasoning: r.get("reasoning"),
        status: status.parse()?,
        created_at: parse_dt(&r.get::<String, _>("created_at")),
        updated_at: parse_dt(&r.get::<String, _>("updated_at")),
        remote_updated_at: r
            .get::<Option<String>, _>("remote_updated_at")
            .map(|s| parse_dt(&s)),
    })
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ── CredentialStore ─────────────────────────────────────────────

#[async_trait]
impl CredentialStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, credential), fields(provider = %credential.provider))]
    async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (owner_id, provider, ciphertext, nonce, auth_tag, rotated_at, external_account_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(owner_id, provider) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                nonce = excluded.nonce,
                auth_tag = excluded.auth_tag,
                rotated_at = excluded.rotated_at,
                external_account_id = COALESCE(excluded.external_account_id, credentials.external_account_id)",
        )
        .bind(credential.owner_id.to_string())
        .bind(&credential.provider)
        .bind(&credential.ciphertext)
        .bind(&credential.nonce)
        .bind(&credential.auth_tag)
        .bind(fmt_dt(credential.rotated_at))
        .bind(&credential.external_account_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                Error::Conflict(format!(
                    "{} account is already linked to another user",
                    credential.provider
                ))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_credential(&self, owner_id: UserId, provider: &str) -> Result<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE owner_id = ?1 AND provider = ?2")
            .bind(owner_id.to_string())
            .bind(provider)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_credential))
    }

    async fn delete_credential(&self, owner_id: UserId, provider: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM credentials WHERE owner_id = ?1 AND provider = ?2")
            .bind(owner_id.to_string())
            .bind(provider)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_credentials(&self, owner_id: UserId) -> Result<Vec<Credential>> {
        let rows = sqlx::query("SELECT * FROM credentials WHERE owner_id = ?1 ORDER BY provider")
            .bind(owner_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_credential).collect())
    }

    async fn find_credential_owner(
        &self,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<UserId>> {
        let row = sqlx::query(
            "SELECT owner_id FROM credentials
             WHERE provider = ?1 AND external_account_id = ?2
             ORDER BY rotated_at DESC LIMIT 1",
        )
        .bind(provider)
        .bind(external_account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| parse_user_id(&r.get::<String, _>("owner_id"))))
    }

    async fn list_credential_owners(&self) -> Result<Vec<UserId>> {
        let rows = sqlx::query("SELECT DISTINCT owner_id FROM credentials ORDER BY owner_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| parse_user_id(&r.get::<String, _>("owner_id")))
            .collect())
    }
}

// ── ItemStore ───────────────────────────────────────────────────

#[async_trait]
impl ItemStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, item), fields(provider = %item.source_provider, source_id = %item.source_id))]
    async fn upsert_item(
        &self,
        user_id: UserId,
        item: &NormalizedItem,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let details = serde_json::to_string(&item.details)
            .map_err(|e| Error::backend("encode synced item details", e))?;
        let raw = serde_json::to_string(&item.raw_metadata)
            .map_err(|e| Error::backend("encode synced item metadata", e))?;

        let res = sqlx::query(
            "INSERT INTO synced_items
                (user_id, source_provider, source_id, kind, title, item_timestamp, details, raw_metadata,
                 completed, remote_updated_at, needs_scoring, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)
             ON CONFLICT(user_id, source_provider, source_id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                item_timestamp = excluded.item_timestamp,
                details = excluded.details,
                raw_metadata = excluded.raw_metadata,
                completed = excluded.completed,
                remote_updated_at = COALESCE(excluded.remote_updated_at, synced_items.remote_updated_at),
                needs_scoring = 1,
                updated_at = excluded.updated_at
             WHERE excluded.remote_updated_at IS NULL
                OR synced_items.remote_updated_at IS NULL
                OR excluded.remote_updated_at >= synced_items.remote_updated_at",
        )
        .bind(user_id.to_string())
        .bind(&item.source_provider)
        .bind(&item.source_id)
        .bind(item.kind().as_str())
        .bind(&item.title)
        .bind(fmt_dt(item.timestamp))
        .bind(details)
        .bind(raw)
        .bind(item.completed)
        .bind(item.remote_updated_at.map(fmt_dt))
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            Ok(UpsertOutcome::Stale)
        } else {
            Ok(UpsertOutcome::Applied)
        }
    }

    async fn get_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<Option<SyncedItem>> {
        let row = sqlx::query(
            "SELECT * FROM synced_items WHERE user_id = ?1 AND source_provider = ?2 AND source_id = ?3",
        )
        .bind(user_id.to_string())
        .bind(source_provider)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_synced_item).transpose()
    }

    async fn list_items_by_kind(&self, user_id: UserId, kind: ItemKind) -> Result<Vec<SyncedItem>> {
        let rows = sqlx::query(
            "SELECT * FROM synced_items WHERE user_id = ?1 AND kind = ?2 ORDER BY item_timestamp DESC",
        )
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_synced_item).collect()
    }

    async fn find_item_by_kind(
        &self,
        user_id: UserId,
        kind: ItemKind,
        source_id: &str,
    ) -> Result<Option<SyncedItem>> {
        let row = sqlx::query(
            "SELECT * FROM synced_items WHERE user_id = ?1 AND kind = ?2 AND source_id = ?3
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(user_id.to_string())
        .bind(kind.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_synced_item).transpose()
    }

    async fn list_time_sensitive_pending(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<RescoreCandidate>> {
        let rows = sqlx::query(
            "SELECT s.*, q.score AS queue_score, q.reasoning AS queue_reasoning
             FROM synced_items s
             JOIN triage_queue q
               ON q.user_id = s.user_id
              AND q.source_provider = s.source_provider
              AND q.source_id = s.source_id
             WHERE s.user_id = ?1
               AND s.needs_scoring = 0
               AND s.completed = 0
               AND s.kind IN ('task', 'event')
               AND q.status = 'pending'
             ORDER BY s.updated_at ASC LIMIT ?2",
        )
        .bind(user_id.to_string())
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                let score: i64 = r.get("queue_score");
                Ok(RescoreCandidate {
                    item: row_to_synced_item(r)?,
                    score: score.clamp(0, 100) as u8,
                    reasoning: r.get("queue_reasoning"),
                })
            })
            .collect()
    }

    async fn list_items_needing_scoring(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<SyncedItem>> {
        let rows = sqlx::query(
            "SELECT * FROM synced_items WHERE user_id = ?1 AND needs_scoring = 1
             ORDER BY updated_at ASC LIMIT ?2",
        )
        .bind(user_id.to_string())
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_synced_item).collect()
    }

    async fn mark_scored(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
        seen_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE synced_items SET needs_scoring = 0
             WHERE user_id = ?1 AND source_provider = ?2 AND source_id = ?3 AND updated_at = ?4",
        )
        .bind(user_id.to_string())
        .bind(source_provider)
        .bind(source_id)
        .bind(fmt_dt(seen_updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn retract_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE synced_items SET completed = 1, needs_scoring = 1, updated_at = ?4
             WHERE user_id = ?1 AND source_provider = ?2 AND source_id = ?3",
        )
        .bind(user_id.to_string())
        .bind(source_provider)
        .bind(source_id)
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn get_cursor(&self, user_id: UserId, provider: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT cursor FROM sync_cursors WHERE user_id = ?1 AND provider = ?2")
            .bind(user_id.to_string())
            .bind(provider)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("cursor")))
    }

    async fn save_cursor(
        &self,
        user_id: UserId,
        provider: &str,
        cursor: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursors (user_id, provider, cursor, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, provider) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(provider)
        .bind(cursor)
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

// ── TriageQueueStore ────────────────────────────────────────────

#[async_trait]
impl TriageQueueStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, entry), fields(provider = %entry.source_provider, source_id = %entry.source_id))]
    async fn merge_scored(&self, entry: &TriageQueueItem) -> Result<MergeOutcome> {
        let res = sqlx::query(
            "INSERT INTO triage_queue
                (id, user_id, source_provider, source_id, title, score, reasoning, status,
                 created_at, updated_at, remote_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(user_id, source_provider, source_id) DO UPDATE SET
                title = excluded.title,
                score = excluded.score,
                reasoning = excluded.reasoning,
                updated_at = excluded.updated_at,
                remote_updated_at = COALESCE(excluded.remote_updated_at, triage_queue.remote_updated_at)
             WHERE triage_queue.status = 'pending'
               AND (excluded.remote_updated_at IS NULL
                    OR triage_queue.remote_updated_at IS NULL
                    OR excluded.remote_updated_at >= triage_queue.remote_updated_at)",
        )
        .bind(entry.id.to_string())
        .bind(entry.user_id.to_string())
        .bind(&entry.source_provider)
        .bind(&entry.source_id)
        .bind(&entry.title)
        .bind(i64::from(entry.score.min(100)))
        .bind(&entry.reasoning)
        .bind(entry.status.as_str())
        .bind(fmt_dt(entry.created_at))
        .bind(fmt_dt(entry.updated_at))
        .bind(entry.remote_updated_at.map(fmt_dt))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            Ok(MergeOutcome::Preserved)
        } else {
            Ok(MergeOutcome::Written)
        }
    }

    async fn get_queue_item(&self, user_id: UserId, id: Uuid) -> Result<Option<TriageQueueItem>> {
        let row = sqlx::query("SELECT * FROM triage_queue WHERE id = ?1 AND user_id = ?2")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_queue_item).transpose()
    }

    async fn find_queue_item(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<Option<TriageQueueItem>> {
        let row = sqlx::query(
            "SELECT * FROM triage_queue WHERE user_id = ?1 AND source_provider = ?2 AND source_id = ?3",
        )
        .bind(user_id.to_string())
        .bind(source_provider)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_queue_item).transpose()
    }

    async fn list_queue(
        &self,
        user_id: UserId,
        status: Option<TriageStatus>,
        limit: usize,
    ) -> Result<Vec<TriageQueueItem>> {
        let rows = match status {
            Some(status) => sqlx::query(
                "SELECT * FROM triage_queue WHERE user_id = ?1 AND status = ?2
                 ORDER BY score DESC, created_at DESC LIMIT ?3",
            )
            .bind(user_id.to_string())
            .bind(status.as_str())
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query(
                "SELECT * FROM triage_queue WHERE user_id = ?1
                 ORDER BY score DESC, created_at DESC LIMIT ?2",
            )
            .bind(user_id.to_string())
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
        };
        rows.iter().map(row_to_queue_item).collect()
    }

    async fn set_status(
        &self,
        user_id: UserId,
        id: Uuid,
        from: TriageStatus,
        to: TriageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE triage_queue SET status = ?4, updated_at = ?5
             WHERE id = ?1 AND user_id = ?2 AND status = ?3",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        source_provider: &str,
        source_id: &str,
    ) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM triage_queue
             WHERE user_id = ?1 AND source_provider = ?2 AND source_id = ?3 AND status = 'pending'",
        )
        .bind(user_id.to_string())
        .bind(source_provider)
        .bind(source_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }
}

// ── CounterStore ────────────────────────────────────────────────

#[async_trait]
impl CounterStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, key), fields(limiter = %key.limiter))]
    async fn increment(&self, key: &WindowKey) -> Result<u64> {
        let window_start = key.window_start.timestamp_millis();
        let row = sqlx::query(
            "INSERT INTO rate_limit_counters (limiter_name, identity, window_start, count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(limiter_name, identity, window_start)
             DO UPDATE SET count = rate_limit_counters.count + 1
             RETURNING count",
        )
        .bind(&key.limiter)
        .bind(&key.identity)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let count: i64 = row.get("count");

        if count == 1 {
            sqlx::query(
                "DELETE FROM rate_limit_counters
                 WHERE limiter_name = ?1 AND identity = ?2 AND window_start < ?3",
            )
            .bind(&key.limiter)
            .bind(&key.identity)
            .bind(window_start)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
