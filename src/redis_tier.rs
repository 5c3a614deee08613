//! Shared remote tier over Redis

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use std::time::Duration;

use crate::{Result, TierBackend};

/// Remote tier shared by every process pointing at the same Redis.
///
/// The connection manager reconnects on its own and is cheap to clone, so each
/// call works on its own clone.
#[derive(Clone)]
pub struct RedisTier {
    redis: redis::aio::ConnectionManager,
}

impl RedisTier {
    pub async fn new(redis_client: redis::Client) -> Result<Self> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { redis })
    }

    pub fn from_manager(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl TierBackend for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.redis.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value.to_vec(), millis).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.redis.clone();
        // -2: no such key, -1: no expiry
        let millis: i64 = conn.pttl(key).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
