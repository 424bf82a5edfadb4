//! Windowed admission control keyed by `(limiter_name, identity, window_start)`.
//!
//! Every call performs one atomic increment-and-return against an injected
//! `CounterStore`; the decision is `count <= cap`. Each limiter carries an
//! explicit `FailureMode` for when the counter store is unreachable.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

pub const OUTBOUND_PROVIDER: &str = "outbound_provider";
pub const INBOUND_WEBHOOK: &str = "inbound_webhook";
pub const USER_SYNC: &str = "user_sync";
pub const AI_CLASSIFIER: &str = "ai_classifier";

/// What a limiter answers when its counter store errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Deny. Used for everything adjacent to provider credentials.
    FailClosed,
    /// Allow and log. Only for cost throttles.
    FailOpen,
}

/// One counter slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub limiter: String,
    pub identity: String,
    pub window_start: DateTime<Utc>,
    pub window: Duration,
}

impl WindowKey {
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + chrono::Duration::milliseconds(window_millis(self.window))
    }

    /// `limiter:identity:window_start_ms`, the flat form used by key/value backends.
    pub fn flat(&self) -> String {
        format!(
            "{}:{}:{}",
            self.limiter,
            self.identity,
            self.window_start.timestamp_millis()
        )
    }
}

/// Shared counter backend. `increment` must be atomic per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, key: &WindowKey) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub name: String,
    pub cap: u64,
    pub window: Duration,
    pub failure_mode: FailureMode,
}

impl RateLimitPolicy {
    pub fn new(name: impl Into<String>, cap: u64, window: Duration, failure_mode: FailureMode) -> Self {
        Self {
            name: name.into(),
            cap,
            window,
            failure_mode,
        }
    }

    pub fn outbound_provider(cap: u64, window: Duration) -> Self {
        Self::new(OUTBOUND_PROVIDER, cap, window, FailureMode::FailClosed)
    }

    pub fn inbound_webhook(cap: u64, window: Duration) -> Self {
        Self::new(INBOUND_WEBHOOK, cap, window, FailureMode::FailClosed)
    }

    pub fn user_sync(cap: u64, window: Duration) -> Self {
        Self::new(USER_SYNC, cap, window, FailureMode::FailClosed)
    }

    pub fn ai_classifier(cap: u64, window: Duration) -> Self {
        Self::new(AI_CLASSIFIER, cap, window, FailureMode::FailOpen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("rate limit '{limiter}' exceeded; retry at {reset_at}")]
pub struct RateLimitExceeded {
    pub limiter: String,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitExceeded {
    /// Whole seconds until `reset_at`, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000).max(1)
    }
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Start of the window containing `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let w = window_millis(window);
    let start = now.timestamp_millis().div_euclid(w) * w;
    Utc.timestamp_millis_opt(start).single().unwrap_or(now)
}

#[derive(Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub async fn limit(&self, identity: &str) -> RateLimitDecision {
        self.limit_at(identity, Utc::now()).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(limiter = %self.policy.name))]
    pub async fn limit_at(&self, identity: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let key = WindowKey {
            limiter: self.policy.name.clone(),
            identity: identity.to_string(),
            window_start: window_start(now, self.policy.window),
            window: self.policy.window,
        };
        let reset_at = key.reset_at();
        let cap = self.policy.cap;

        match self.store.increment(&key).await {
            Ok(count) => RateLimitDecision {
                allowed: count <= cap,
                limit: cap,
                remaining: cap.saturating_sub(count),
                reset_at,
            },
            Err(e) => {
                let allowed = self.policy.failure_mode == FailureMode::FailOpen;
                tracing::warn!(
                    limiter = %self.policy.name,
                    identity,
                    allowed,
                    error = %e,
                    "rate limit counter store unavailable"
                );
                RateLimitDecision {
                    allowed,
                    limit: cap,
                    remaining: 0,
                    reset_at,
                }
            }
        }
    }

    /// `limit` as a `Result`, for call sites that just want to bail out.
    pub async fn check(&self, identity: &str) -> std::result::Result<RateLimitDecision, RateLimitExceeded> {
        self.check_at(identity, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<RateLimitDecision, RateLimitExceeded> {
        let decision = self.limit_at(identity, now).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitExceeded {
                limiter: self.policy.name.clone(),
                reset_at: decision.reset_at,
            })
        }
    }
}

/// The four limiters the pipeline uses, sharing one counter store.
#[derive(Debug, Clone)]
pub struct Limiters {
    pub outbound_provider: RateLimiter,
    pub inbound_webhook: RateLimiter,
    pub user_sync: RateLimiter,
    pub ai_classifier: RateLimiter,
}

impl Limiters {
    pub fn new(store: Arc<dyn CounterStore>, policies: LimiterPolicies) -> Self {
        Self {
            outbound_provider: RateLimiter::new(policies.outbound_provider, store.clone()),
            inbound_webhook: RateLimiter::new(policies.inbound_webhook, store.clone()),
            user_sync: RateLimiter::new(policies.user_sync, store.clone()),
            ai_classifier: RateLimiter::new(policies.ai_classifier, store),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()), LimiterPolicies::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterPolicies {
    pub outbound_provider: RateLimitPolicy,
    pub inbound_webhook: RateLimitPolicy,
    pub user_sync: RateLimitPolicy,
    pub ai_classifier: RateLimitPolicy,
}

impl Default for LimiterPolicies {
    fn default() -> Self {
        Self {
            outbound_provider: RateLimitPolicy::outbound_provider(30, Duration::from_secs(60)),
            inbound_webhook: RateLimitPolicy::inbound_webhook(120, Duration::from_secs(60)),
            user_sync: RateLimitPolicy::user_sync(6, Duration::from_secs(60)),
            ai_classifier: RateLimitPolicy::ai_classifier(20, Duration::from_secs(60)),
        }
    }
}
