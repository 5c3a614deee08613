//! Tiered read-through cache store
//!
//! This module composes an ordered list of [`TierBackend`]s into one logical cache:
//! - `get` consults tiers in order and back-fills the faster ones on a hit
//! - `set` writes every tier
//! - `del` evicts from every tier and broadcasts the eviction to other processes
//! - `take` reads through to a caller-supplied query on a miss, caching both
//!   found values and not-found placeholders
//!
//! Concurrent `take` calls for the same key are coalesced into one load.

use bytes::Bytes;
use rand::Rng;
use serde::{Serialize, de::DeserializeOwned};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

use crate::{
    CacheConfig, CacheError, Result, TierBackend,
    inflight::{Admission, InFlightTable, Outcome},
    pubsub::{InvalidationMessage, InvalidationPublisher},
};

/// Payload marking a key whose row is known not to exist.
pub const NOT_FOUND_PLACEHOLDER: &[u8] = b"*";

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Result of a plain cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached<V> {
    Hit(V),
    /// A not-found placeholder is cached for the key.
    Placeholder,
    Miss,
}

enum RawLookup {
    Hit(Bytes),
    Placeholder,
    Miss,
}

/// One table's view of the cache.
///
/// Cheap to clone; clones share tiers and the coalescing table.
#[derive(Clone)]
pub struct TieredStore {
    inner: Arc<TieredStoreInner>,
}

struct TieredStoreInner {
    table: String,
    tiers: Vec<Arc<dyn TierBackend>>,
    config: CacheConfig,
    in_flight: Arc<InFlightTable>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    origin: String,
}

impl TieredStore {
    pub(crate) fn new(
        table: String,
        tiers: Vec<Arc<dyn TierBackend>>,
        config: CacheConfig,
        in_flight: Arc<InFlightTable>,
        publisher: Option<Arc<dyn InvalidationPublisher>>,
        origin: String,
    ) -> Self {
        Self {
            inner: Arc::new(TieredStoreInner {
                table,
                tiers,
                config,
                in_flight,
                publisher,
                origin,
            }),
        }
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look `key` up without ever calling the record store.
    ///
    /// An entry that fails to decode is deleted and reported as a miss.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Cached<V>> {
        match self.lookup(key).await? {
            RawLookup::Hit(bytes) => match self.decode(key, &bytes).await {
                Some(value) => Ok(Cached::Hit(value)),
                None => Ok(Cached::Miss),
            },
            RawLookup::Placeholder => Ok(Cached::Placeholder),
            RawLookup::Miss => Ok(Cached::Miss),
        }
    }

    /// Cache `value` under `key` with the configured (jittered) expiration.
    pub async fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        self.set_with_expire(key, value, self.granted_expiration())
            .await
    }

    pub async fn set_with_expire<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        expire: Duration,
    ) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.write(key, payload, expire).await
    }

    /// Evict `keys` from every tier and tell other processes to drop them from
    /// their local tiers.
    ///
    /// Every tier is attempted; the first failure is returned.
    pub async fn del<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_owned()).collect();

        let mut first_err = None;
        for tier in &self.inner.tiers {
            if let Err(e) = tier.del(&keys).await {
                warn!("{} tier DEL failed for keys {:?}: {}", tier.name(), keys, e);
                first_err.get_or_insert(e);
            }
        }

        if let Some(publisher) = &self.inner.publisher {
            let message = InvalidationMessage {
                hostname: self.inner.origin.clone(),
                table: self.inner.table.clone(),
                keys: keys.clone(),
            };
            match publisher.publish(&message).await {
                Ok(()) => debug!("Published invalidation for keys {:?}", keys),
                Err(e) => warn!(
                    "Invalidation publish failed for keys {:?}: {}. Continuing.",
                    keys, e
                ),
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read-through lookup.
    ///
    /// On a miss `query` is called; a found value is cached, a
    /// [`CacheError::NotFound`] is cached as a placeholder, and any other error is
    /// returned without caching anything.
    pub async fn take<V, F, Fut>(&self, key: &str, query: F) -> Result<V>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.take_with_expire(key, |_| query()).await
    }

    /// Like [`take`](Self::take), but hands the query the expiration its value
    /// will be cached with.
    pub async fn take_with_expire<V, F, Fut>(&self, key: &str, query: F) -> Result<V>
    where
        V: Cacheable,
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let guard = match self.inner.in_flight.admit(key) {
            Admission::Leader(guard) => guard,
            Admission::Waiter(waiter) => {
                debug!("Waiting for in-flight load of key: {}", key);
                let bytes = waiter.outcome().await?;
                return Ok(serde_json::from_slice(&bytes)?);
            }
        };

        // The guard reports cancellation to waiters if this future is dropped
        // before the load finishes.
        match self.load(key, query).await {
            Ok((value, bytes)) => {
                guard.complete(Outcome::Loaded(bytes));
                Ok(value)
            }
            Err(e) => Err(guard.fail(e)),
        }
    }

    async fn load<V, F, Fut>(&self, key: &str, query: F) -> Result<(V, Bytes)>
    where
        V: Cacheable,
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.lookup(key).await? {
            RawLookup::Hit(bytes) => {
                if let Some(value) = self.decode(key, &bytes).await {
                    return Ok((value, bytes));
                }
            }
            RawLookup::Placeholder => {
                debug!("Cached not-found for key: {}", key);
                return Err(CacheError::NotFound);
            }
            RawLookup::Miss => {}
        }

        let expire = self.granted_expiration();
        match query(expire).await {
            Ok(value) => {
                debug!("Loaded key {} from record store", key);
                let bytes = Bytes::from(serde_json::to_vec(&value)?);
                self.write(key, bytes.clone(), expire).await?;
                Ok((value, bytes))
            }
            Err(CacheError::NotFound) => {
                debug!("Record not found for key {}; caching placeholder", key);
                self.write(
                    key,
                    Bytes::from_static(NOT_FOUND_PLACEHOLDER),
                    self.inner.config.not_found_expiration,
                )
                .await?;
                Err(CacheError::NotFound)
            }
            Err(e) => {
                error!("Record store error for key {}: {}", key, e);
                Err(e)
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<RawLookup> {
        for (idx, tier) in self.inner.tiers.iter().enumerate() {
            let Some(bytes) = tier.get(key).await? else {
                continue;
            };
            debug!("Cache hit {} for key: {}", tier.name(), key);

            let lookup = classify(bytes);
            if idx > 0 {
                self.backfill(idx, key, &lookup).await;
            }
            return Ok(lookup);
        }

        debug!("Cache miss for key: {}", key);
        Ok(RawLookup::Miss)
    }

    /// Copy an entry found in tier `upto` into every tier in front of it.
    ///
    /// The copy lives for whatever is left of the source entry's lifetime,
    /// capped at the configured expiration, so a nearly expired remote entry does
    /// not get a fresh full lifetime locally. Tiers that cannot report a
    /// remaining lifetime get the configured one.
    async fn backfill(&self, upto: usize, key: &str, lookup: &RawLookup) {
        let (payload, configured) = match lookup {
            RawLookup::Hit(bytes) => (bytes.clone(), self.inner.config.expiration),
            RawLookup::Placeholder => (
                Bytes::from_static(NOT_FOUND_PLACEHOLDER),
                self.inner.config.not_found_expiration,
            ),
            RawLookup::Miss => return,
        };

        let source = &self.inner.tiers[upto];
        let ttl = match source.ttl(key).await {
            Ok(Some(remaining)) => remaining.min(configured),
            Ok(None) => configured,
            Err(e) => {
                warn!("{} tier TTL lookup failed for key {}: {}", source.name(), key, e);
                configured
            }
        };
        if ttl.is_zero() {
            return;
        }

        for tier in &self.inner.tiers[..upto] {
            if let Err(e) = tier.set(key, payload.clone(), ttl).await {
                warn!("{} tier back-fill failed for key {}: {}", tier.name(), key, e);
            }
        }
    }

    /// Decode a cached payload, deleting it if it is corrupt.
    async fn decode<V: DeserializeOwned>(&self, key: &str, bytes: &Bytes) -> Option<V> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.del(&[key]).await {
                    warn!("Failed to delete corrupt entry for key {}: {}", key, del_err);
                }
                None
            }
        }
    }

    async fn write(&self, key: &str, payload: Bytes, expire: Duration) -> Result<()> {
        for tier in &self.inner.tiers {
            tier.set(key, payload.clone(), expire).await?;
        }
        Ok(())
    }

    /// Positive expiration with the configured jitter applied.
    ///
    /// A deviation that is not a finite number disables jitter, and a jittered
    /// value that does not fit in a `Duration` falls back to the configured one.
    fn granted_expiration(&self) -> Duration {
        let config = &self.inner.config;
        let deviation = config.expiry_deviation;
        if !deviation.is_finite() || deviation <= 0.0 {
            return config.expiration;
        }
        let deviation = deviation.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-deviation..deviation);
        Duration::try_from_secs_f64(config.expiration.as_secs_f64() * factor)
            .unwrap_or(config.expiration)
    }
}

fn classify(bytes: Bytes) -> RawLookup {
    if bytes.as_ref() == NOT_FOUND_PLACEHOLDER {
        RawLookup::Placeholder
    } else if bytes.is_empty() {
        RawLookup::Miss
    } else {
        RawLookup::Hit(bytes)
    }
}
