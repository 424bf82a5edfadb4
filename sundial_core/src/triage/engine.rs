use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::rules;
use super::traits::{ScoringError, TextClassifier};
use crate::models::{ItemDetails, NormalizedItem, TriageQueueItem, TriageStatus, UserId};
use crate::ratelimit::RateLimiter;
use crate::store::{ItemStore, MergeOutcome, TriageQueueStore};
use crate::{Error, Result};

/// Hard cap on queue reads.
pub const MAX_QUEUE_READ: usize = 50;
const DEFAULT_PASS_BATCH: usize = 500;
const SNIPPET_CHARS: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemScore {
    pub score: u8,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredItem {
    pub source_provider: String,
    pub source_id: String,
    pub reason: ScoringError,
}

/// What one scoring pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageOutcome {
    /// Queue rows inserted or refreshed.
    pub scored: usize,
    /// Rows left alone because the user already decided or a newer delta won.
    pub preserved: usize,
    /// Pending rows dropped because the remote item was completed or deleted.
    pub retracted: usize,
    /// Items still flagged for scoring; retried on the next pass.
    pub deferred: Vec<DeferredItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Scores synced items into the per-user triage queue.
#[derive(Clone)]
pub struct TriageEngine {
    items: Arc<dyn ItemStore>,
    queue: Arc<dyn TriageQueueStore>,
    classifier: Option<Arc<dyn TextClassifier>>,
    classifier_limiter: Option<RateLimiter>,
    batch: usize,
}

impl TriageEngine {
    pub fn new(items: Arc<dyn ItemStore>, queue: Arc<dyn TriageQueueStore>) -> Self {
        Self {
            items,
            queue,
            classifier: None,
            classifier_limiter: None,
            batch: DEFAULT_PASS_BATCH,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TextClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_classifier_limiter(mut self, limiter: RateLimiter) -> Self {
        self.classifier_limiter = Some(limiter);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Score one item. Rules for structured kinds, the classifier for email.
    #[tracing::instrument(level = "debug", skip(self, item), fields(provider = %item.source_provider, source_id = %item.source_id))]
    pub async fn score_item(
        &self,
        user_id: UserId,
        item: &NormalizedItem,
        now: DateTime<Utc>,
    ) -> std::result::Result<ItemScore, ScoringError> {
        if let Some(rule) = rules::score_item(item, now) {
            return Ok(ItemScore {
                score: rule.score,
                reasoning: rule.reasoning,
            });
        }

        let classifier = self.classifier.as_ref().ok_or_else(|| {
            ScoringError::ClassifierUnavailable("no classifier configured".to_string())
        })?;
        if let Some(limiter) = &self.classifier_limiter {
            limiter
                .check_at(&user_id.to_string(), now)
                .await
                .map_err(|e| ScoringError::Throttled {
                    reset_at: e.reset_at,
                })?;
        }

        let c = classifier.classify(&classifier_text(item)).await?;
        Ok(ItemScore {
            score: c.score.min(100),
            reasoning: c.reasoning,
        })
    }

    pub async fn run_pass(&self, user_id: UserId) -> TriageOutcome {
        self.run_pass_at(user_id, Utc::now()).await
    }

    /// Score every item of `user_id` still flagged `needs_scoring`.
    ///
    /// Never fails as a whole: storage trouble lands in `error`, classifier
    /// trouble in `deferred`.
    #[tracing::instrument(level = "info", skip(self), fields(user_id = %user_id))]
    pub async fn run_pass_at(&self, user_id: UserId, now: DateTime<Utc>) -> TriageOutcome {
        let mut outcome = TriageOutcome::default();
        let pending = match self
            .items
            .list_items_needing_scoring(user_id, self.batch)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "triage pass could not load items");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        for synced in pending {
            if let Err(e) = self.process(user_id, &synced.item, synced.updated_at, now, &mut outcome).await {
                tracing::warn!(
                    provider = %synced.item.source_provider,
                    source_id = %synced.item.source_id,
                    error = %e,
                    "triage pass aborted on storage error"
                );
                outcome.error = Some(e.to_string());
                break;
            }
        }

        if outcome.error.is_none() {
            if let Err(e) = self.refresh_time_sensitive(user_id, now, &mut outcome).await {
                tracing::warn!(error = %e, "time-sensitive rescoring aborted on storage error");
                outcome.error = Some(e.to_string());
            }
        }

        tracing::info!(
            scored = outcome.scored,
            preserved = outcome.preserved,
            retracted = outcome.retracted,
            deferred = outcome.deferred.len(),
            "triage pass finished"
        );
        outcome
    }

    async fn process(
        &self,
        user_id: UserId,
        item: &NormalizedItem,
        seen_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
        outcome: &mut TriageOutcome,
    ) -> Result<()> {
        if item.completed {
            if self
                .queue
                .remove_pending(user_id, &item.source_provider, &item.source_id)
                .await?
            {
                outcome.retracted += 1;
            }
        } else {
            let scored = match self.score_item(user_id, item, now).await {
                Ok(s) => s,
                Err(reason) => {
                    tracing::debug!(source_id = %item.source_id, %reason, "scoring deferred");
                    outcome.deferred.push(DeferredItem {
                        source_provider: item.source_provider.clone(),
                        source_id: item.source_id.clone(),
                        reason,
                    });
                    return Ok(());
                }
            };
            let entry = TriageQueueItem::pending(user_id, item, scored.score, scored.reasoning, now);
            match self.queue.merge_scored(&entry).await? {
                MergeOutcome::Written => outcome.scored += 1,
                MergeOutcome::Preserved => outcome.preserved += 1,
            }
        }

        // A concurrent upsert in between keeps the flag set for the next pass.
        self.items
            .mark_scored(user_id, &item.source_provider, &item.source_id, seen_updated_at)
            .await?;
        Ok(())
    }

    /// Due dates and start times drift relative to `now`, so pending tasks and
    /// events are re-run through the rules every pass even when unchanged.
    async fn refresh_time_sensitive(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        outcome: &mut TriageOutcome,
    ) -> Result<()> {
        let candidates = self.items.list_time_sensitive_pending(user_id, self.batch).await?;
        for c in candidates {
            let Some(rule) = rules::score_item(&c.item.item, now) else {
                continue;
            };
            if rule.score == c.score && rule.reasoning == c.reasoning {
                continue;
            }
            tracing::debug!(
                source_id = %c.item.item.source_id,
                from = c.score,
                to = rule.score,
                "rescored as time passed"
            );
            let entry =
                TriageQueueItem::pending(user_id, &c.item.item, rule.score, rule.reasoning, now);
            match self.queue.merge_scored(&entry).await? {
                MergeOutcome::Written => outcome.scored += 1,
                MergeOutcome::Preserved => outcome.preserved += 1,
            }
        }
        Ok(())
    }

    /// Queue read ordered by score then recency, capped at `MAX_QUEUE_READ`.
    pub async fn list(
        &self,
        user_id: UserId,
        status: Option<TriageStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<TriageQueueItem>> {
        let limit = limit.unwrap_or(MAX_QUEUE_READ).clamp(1, MAX_QUEUE_READ);
        self.queue.list_queue(user_id, status, limit).await
    }

    /// Apply a user decision to a queue row.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn transition(
        &self,
        user_id: UserId,
        id: Uuid,
        to: TriageStatus,
    ) -> Result<TriageQueueItem> {
        let current = self
            .queue
            .get_queue_item(user_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("triage item {id}")))?;

        if !current.status.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "cannot move triage item from {} to {}",
                current.status.as_str(),
                to.as_str()
            )));
        }
        let now = Utc::now();
        if !self
            .queue
            .set_status(user_id, id, current.status, to, now)
            .await?
        {
            return Err(Error::Conflict(format!(
                "triage item {id} changed concurrently"
            )));
        }

        self.queue
            .get_queue_item(user_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("triage item {id}")))
    }
}

fn classifier_text(item: &NormalizedItem) -> String {
    let mut text = String::new();
    if let ItemDetails::Email { from, snippet } = &item.details {
        if let Some(from) = from {
            text.push_str("From: ");
            text.push_str(from);
            text.push('\n');
        }
        text.push_str("Subject: ");
        text.push_str(&item.title);
        text.push('\n');
        if let Some(snippet) = snippet {
            text.push('\n');
            text.extend(snippet.chars().take(SNIPPET_CHARS));
        }
    } else {
        text.push_str(&item.title);
    }
    text
}
