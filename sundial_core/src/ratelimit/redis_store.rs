use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{CounterStore, WindowKey};
use crate::{Error, Result};

/// Counters shared across processes through Redis.
///
/// `INCR` and `PEXPIREAT` run in one `MULTI` block, so a key never outlives its
/// window even if the caller disappears between the two commands.
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisCounterStore {
    #[tracing::instrument(level = "debug")]
    pub async fn connect(url: &str, prefix: Option<&str>) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::backend("redis client open", e))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::backend("redis connect", e))?;
        Ok(Self {
            manager,
            prefix: prefix
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or("sundial")
                .to_string(),
        })
    }

    fn scoped(&self, key: &WindowKey) -> String {
        format!("{}:ratelimit:{}", self.prefix, key.flat())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[tracing::instrument(level = "debug", skip(self, key), fields(limiter = %key.limiter))]
    async fn increment(&self, key: &WindowKey) -> Result<u64> {
        let redis_key = self.scoped(key);
        let expire_at_ms = key.reset_at().timestamp_millis();
        let mut conn = self.manager.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&redis_key, 1u64)
            .cmd("PEXPIREAT")
            .arg(&redis_key)
            .arg(expire_at_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis rate limit incr", e))?;
        Ok(count)
    }
}
