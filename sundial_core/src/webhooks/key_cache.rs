use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::Jwk;
use std::time::Duration;

pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(5 * 60);
/// How long a kid the provider could not supply is answered from cache.
pub const DEFAULT_MISS_TTL: Duration = Duration::from_secs(30);
const MAX_MISSES: usize = 1_024;

#[derive(Debug, Clone)]
struct CachedKey {
    jwk: Jwk,
    fetched_at: DateTime<Utc>,
}

/// Verification keys keyed by `(provider, kid)`, expiring after a fixed TTL.
///
/// Owned by whoever builds the verifier; nothing here is process-global.
#[derive(Debug)]
pub struct KeyCache {
    ttl: Duration,
    miss_ttl: Duration,
    entries: DashMap<(String, String), CachedKey>,
    misses: DashMap<(String, String), DateTime<Utc>>,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL)
    }
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            miss_ttl: DEFAULT_MISS_TTL,
            entries: DashMap::new(),
            misses: DashMap::new(),
        }
    }

    pub fn with_miss_ttl(mut self, miss_ttl: Duration) -> Self {
        self.miss_ttl = miss_ttl;
        self
    }

    fn expired(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        older_than(self.ttl, fetched_at, now)
    }

    pub fn get(&self, provider: &str, kid: &str, now: DateTime<Utc>) -> Option<Jwk> {
        let key = (provider.to_string(), kid.to_string());
        let hit = self.entries.get(&key).map(|e| e.clone())?;
        if self.expired(hit.fetched_at, now) {
            self.entries.remove(&key);
            return None;
        }
        Some(hit.jwk)
    }

    pub fn insert(&self, provider: &str, kid: &str, jwk: Jwk, now: DateTime<Utc>) {
        self.entries.insert(
            (provider.to_string(), kid.to_string()),
            CachedKey {
                jwk,
                fetched_at: now,
            },
        );
    }

    pub fn invalidate(&self, provider: &str, kid: &str) {
        self.entries.remove(&(provider.to_string(), kid.to_string()));
    }

    /// Remember that the provider had no key for `kid`.
    pub fn mark_missing(&self, provider: &str, kid: &str, now: DateTime<Utc>) {
        if self.misses.len() >= MAX_MISSES {
            self.misses.retain(|_, at| !older_than(self.miss_ttl, *at, now));
            if self.misses.len() >= MAX_MISSES {
                return;
            }
        }
        self.misses.insert((provider.to_string(), kid.to_string()), now);
    }

    pub fn is_known_missing(&self, provider: &str, kid: &str, now: DateTime<Utc>) -> bool {
        let key = (provider.to_string(), kid.to_string());
        let Some(at) = self.misses.get(&key).map(|e| *e) else {
            return false;
        };
        if older_than(self.miss_ttl, at, now) {
            self.misses.remove(&key);
            return false;
        }
        true
    }

    /// Drop every expired entry, misses included. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len() + self.misses.len();
        self.entries.retain(|_, v| !self.expired(v.fetched_at, now));
        self.misses.retain(|_, at| !older_than(self.miss_ttl, *at, now));
        before - self.entries.len() - self.misses.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn older_than(ttl: Duration, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    now - at >= ttl
}
