//! Cache tiers
//!
//! A tier is a plain key to bytes store with per-entry expiry. The tiered store
//! layers several of them (usually [`LocalTier`] in front of
//! [`RedisTier`](crate::RedisTier)) into one logical cache.

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::Result;

/// A single cache tier.
///
/// Implementations must be safe for concurrent use; the tiered store shares one
/// instance between every caller.
#[async_trait]
pub trait TierBackend: Send + Sync {
    /// Fetch the raw payload stored under `key`, if it has not expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove every key in `keys`. Missing keys are not an error.
    async fn del(&self, keys: &[String]) -> Result<()>;

    /// Lifetime left on `key`, or `None` when the tier cannot tell (missing key,
    /// no expiry, or a backend that does not track it).
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
        Ok(None)
    }

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

struct Entry {
    data: Bytes,
    expires_at: Instant,
}

/// In-process tier backed by a bounded Moka cache.
///
/// Clones share the same underlying map, which is how the registry keeps a
/// handle for evicting keys named in invalidation broadcasts.
#[derive(Clone)]
pub struct LocalTier {
    cache: Cache<String, Arc<Entry>>,
}

impl LocalTier {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Drop `keys` from this process only.
    pub async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            self.cache.invalidate(key).await;
        }
    }
}

#[async_trait]
impl TierBackend for LocalTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(entry) = self.cache.get(key).await else {
            return Ok(None);
        };
        if Instant::now() >= entry.expires_at {
            self.cache.invalidate(key).await;
            return Ok(None);
        }
        Ok(Some(entry.data.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let entry = Arc::new(Entry {
            data: value,
            expires_at: Instant::now() + ttl,
        });
        self.cache.insert(key.to_owned(), entry).await;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        self.invalidate(keys).await;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let Some(entry) = self.cache.get(key).await else {
            return Ok(None);
        };
        let now = Instant::now();
        if now >= entry.expires_at {
            return Ok(None);
        }
        Ok(Some(entry.expires_at - now))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_local_tier_expires_entries() {
        let tier = LocalTier::new(100);
        tier.set("k", Bytes::from_static(b"1"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(tier.get("k").await.unwrap(), Some(Bytes::from_static(b"1")));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_tier_reports_remaining_ttl() {
        let tier = LocalTier::new(100);
        tier.set("k", Bytes::from_static(b"1"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tier.ttl("k").await.unwrap(), Some(Duration::from_secs(6)));
        assert_eq!(tier.ttl("missing").await.unwrap(), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tier.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_tier_del_many() {
        let tier = LocalTier::new(100);
        for key in ["a", "b", "c"] {
            tier.set(key, Bytes::from_static(b"x"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        tier.del(&["a".to_owned(), "c".to_owned(), "missing".to_owned()])
            .await
            .unwrap();

        assert!(tier.get("a").await.unwrap().is_none());
        assert!(tier.get("b").await.unwrap().is_some());
        assert!(tier.get("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let tier = LocalTier::new(100);
        let handle = tier.clone();
        tier.set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();

        handle.invalidate(&["k".to_owned()]).await;
        assert!(tier.get("k").await.unwrap().is_none());
    }
}
