//! Cached model: cache-aside access to one table
//!
//! Rows are cached under their primary key. A secondary (unique) key caches only
//! the row's primary key value, so every read through a secondary key ends at
//! the primary entry, and invalidating the primary entry is enough to make the
//! next read load fresh data.
//!
//! Writes never update cache contents in place; they evict.

use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    Conditions, ExecResult, KeySet, ModelConfig, RecordStore, Result, Row, TieredStore,
};

/// Cache-aside wrapper around a [`RecordStore`]
pub struct CachedModel<S: RecordStore> {
    store: Arc<S>,
    cache: TieredStore,
    keys: Arc<KeySet<S>>,
    config: ModelConfig,
}

impl<S: RecordStore> Clone for CachedModel<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            keys: Arc::clone(&self.keys),
            config: self.config.clone(),
        }
    }
}

impl<S: RecordStore> CachedModel<S> {
    pub fn new(store: S, cache: TieredStore, keys: KeySet<S>, config: ModelConfig) -> Self {
        Self {
            store: Arc::new(store),
            cache,
            keys: Arc::new(keys),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &TieredStore {
        &self.cache
    }

    pub fn key_set(&self) -> &KeySet<S> {
        &self.keys
    }

    /// Primary and secondary cache keys built from `value`
    pub fn keys(&self, value: impl Into<Value>) -> Vec<String> {
        self.keys.keys(&value.into())
    }

    /// Load a row by primary key, reading through the cache.
    pub async fn find_by_primary_key(&self, pk: impl Into<Value>) -> Result<S::Entity> {
        let pk = pk.into();
        let primary = self.keys.primary();
        let key = primary.key(&pk);
        self.cache
            .take(&key, || primary.load(self.store.as_ref(), &pk))
            .await
    }

    /// Load a row by a unique secondary field.
    ///
    /// The secondary entry caches the row's primary key. On a miss the full row is
    /// also written under the primary key, living `safety_gap` longer than the
    /// secondary entry so the pointer never outlives its target. On a hit the
    /// primary key is chased through [`find_by_primary_key`](Self::find_by_primary_key).
    ///
    /// Asking for the primary field itself is a plain primary-key lookup.
    pub async fn find_by_key(&self, field: &str, value: impl Into<Value>) -> Result<S::Entity> {
        let value = value.into();
        let primary = self.keys.primary();
        if field == primary.field() {
            return self.find_by_primary_key(value).await;
        }
        let option = self.keys.option(field);
        let key = option.key(&value);

        let mut loaded = None;
        let slot = &mut loaded;
        let pk: Value = self
            .cache
            .take_with_expire(&key, |expire| async move {
                let entity = option.load(self.store.as_ref(), &value).await?;
                let pk = primary.value_of(&entity)?;
                self.cache
                    .set_with_expire(&primary.key(&pk), &entity, expire + self.config.safety_gap)
                    .await?;
                *slot = Some(entity);
                Ok(pk)
            })
            .await?;

        if let Some(entity) = loaded {
            return Ok(entity);
        }

        debug!("Key {} points at primary key {}", key, pk);
        self.find_by_primary_key(pk).await
    }

    /// Update a row by primary key, then evict its primary cache entry.
    ///
    /// Secondary entries are left alone; they hold only the primary key and are
    /// re-validated through it. A failed eviction fails the update.
    pub async fn update_by_primary_key(
        &self,
        pk: impl Into<Value>,
        changes: Row,
    ) -> Result<ExecResult> {
        let pk = pk.into();
        let result = self
            .store
            .update(changes, &self.primary_conditions(&pk))
            .await?;
        self.cache.del(&[self.keys.primary().key(&pk)]).await?;
        Ok(result)
    }

    /// Delete a row by primary key, then evict its primary cache entry.
    pub async fn delete_by_primary_key(&self, pk: impl Into<Value>) -> Result<ExecResult> {
        let pk = pk.into();
        let result = self.store.delete(&self.primary_conditions(&pk)).await?;
        self.cache.del(&[self.keys.primary().key(&pk)]).await?;
        Ok(result)
    }

    /// Insert a row, then evict any not-found placeholders cached for the
    /// registered key fields it carries.
    pub async fn insert(&self, data: Row) -> Result<ExecResult> {
        let keys = self.keys.keys_in_row(&data);
        let result = self.store.insert(data).await?;
        self.cache.del(&keys).await?;
        Ok(result)
    }

    /// Evict every cache entry that can refer to `entity`, secondary ones included.
    pub async fn invalidate(&self, entity: &S::Entity) -> Result<()> {
        self.cache.del(&self.keys.keys_of(entity)).await
    }

    /// Evict arbitrary keys, e.g. the output of [`keys`](Self::keys).
    pub async fn del<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        self.cache.del(keys).await
    }

    /// Uncached query
    pub async fn find(&self, conditions: &Conditions) -> Result<S::Entity> {
        self.store.find(conditions).await
    }

    /// Uncached count
    pub async fn count(&self, conditions: &Conditions) -> Result<u64> {
        self.store.count(conditions).await
    }

    pub fn safety_gap(&self) -> Duration {
        self.config.safety_gap
    }

    fn primary_conditions(&self, pk: &Value) -> Conditions {
        let mut conditions = Conditions::new();
        conditions.insert(self.keys.primary().field().to_owned(), pk.clone());
        conditions
    }
}
