use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{CounterStore, WindowKey};
use crate::Result;

/// How often idle identities are swept, measured on the request clock.
const SWEEP_EVERY_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct Slot {
    window_start: DateTime<Utc>,
    reset_at: DateTime<Utc>,
    count: u64,
}

/// In-process counters. Only correct for a single server process.
///
/// One slot per (limiter, identity), replaced in place when a new window opens.
#[derive(Debug)]
pub struct MemoryCounterStore {
    slots: DashMap<(String, String), Slot>,
    last_sweep_ms: AtomicI64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
            last_sweep_ms: AtomicI64::new(i64::MIN),
        }
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop identities whose window closed before `now`. Runs at most once per
    /// `SWEEP_EVERY_MS` no matter how many callers race here.
    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SWEEP_EVERY_MS {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.reset_at > now);
        tracing::debug!(
            removed = before.saturating_sub(self.slots.len()),
            "swept idle rate limit counters"
        );
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &WindowKey) -> Result<u64> {
        let count = {
            let mut slot = self
                .slots
                .entry((key.limiter.clone(), key.identity.clone()))
                .or_insert(Slot {
                    window_start: key.window_start,
                    reset_at: key.reset_at(),
                    count: 0,
                });
            if key.window_start > slot.window_start {
                *slot = Slot {
                    window_start: key.window_start,
                    reset_at: key.reset_at(),
                    count: 0,
                };
            }
            slot.count += 1;
            slot.count
        };

        self.maybe_sweep(key.window_start);
        Ok(count)
    }
}
