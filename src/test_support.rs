//! Shared fixtures for the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    CacheConfig, CacheError, CacheRegistry, Cacheable, Conditions, ExecResult, LIMIT_KEY,
    RecordStore, Result, Row, TierBackend,
    pubsub::{InvalidationMessage, InvalidationPublisher},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
}

pub fn test_config() -> CacheConfig {
    CacheConfig {
        enable_local: true,
        local_max_capacity: 1000,
        expiration: Duration::from_secs(60),
        not_found_expiration: Duration::from_secs(10),
        expiry_deviation: 0.0,
    }
}

pub fn user_row(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        other => panic!("row must be an object, got {other}"),
    }
}

/// In-memory table counting how often it is queried
pub struct MemoryStore<E> {
    table: String,
    rows: Mutex<Vec<Row>>,
    finds: AtomicUsize,
    fail_next_find: Mutex<Option<String>>,
    find_delay: Mutex<Option<Duration>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> MemoryStore<E> {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            rows: Mutex::new(Vec::new()),
            finds: AtomicUsize::new(0),
            fail_next_find: Mutex::new(None),
            find_delay: Mutex::new(None),
            _entity: PhantomData,
        }
    }

    pub fn seed(&self, row: Value) {
        self.rows.lock().push(user_row(row));
    }

    pub fn row(&self, id: i64) -> Option<Row> {
        self.rows
            .lock()
            .iter()
            .find(|row| row.get("id") == Some(&Value::from(id)))
            .cloned()
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn fail_next_find(&self, message: &str) {
        *self.fail_next_find.lock() = Some(message.to_owned());
    }

    pub fn set_find_delay(&self, delay: Duration) {
        *self.find_delay.lock() = Some(delay);
    }
}

fn matches(row: &Row, conditions: &Conditions) -> bool {
    conditions
        .iter()
        .filter(|(field, _)| field.as_str() != LIMIT_KEY)
        .all(|(field, value)| row.get(field) == Some(value))
}

#[async_trait]
impl<E: Cacheable> RecordStore for MemoryStore<E> {
    type Entity = E;

    fn table(&self) -> &str {
        &self.table
    }

    async fn find(&self, conditions: &Conditions) -> Result<E> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.find_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail_next_find.lock().take();
        if let Some(message) = failure {
            return Err(CacheError::store(message));
        }

        let row = self
            .rows
            .lock()
            .iter()
            .find(|row| matches(row, conditions))
            .cloned();
        match row {
            Some(row) => Ok(serde_json::from_value(Value::Object(row))?),
            None => Err(CacheError::NotFound),
        }
    }

    async fn insert(&self, data: Row) -> Result<ExecResult> {
        let last_insert_id = data.get("id").and_then(Value::as_i64);
        self.rows.lock().push(data);
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id,
        })
    }

    async fn update(&self, changes: Row, conditions: &Conditions) -> Result<ExecResult> {
        let mut rows_affected = 0;
        for row in self.rows.lock().iter_mut() {
            if matches(row, conditions) {
                row.extend(changes.clone());
                rows_affected += 1;
            }
        }
        Ok(ExecResult {
            rows_affected,
            last_insert_id: None,
        })
    }

    async fn delete(&self, conditions: &Conditions) -> Result<ExecResult> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| !matches(row, conditions));
        Ok(ExecResult {
            rows_affected: (before - rows.len()) as u64,
            last_insert_id: None,
        })
    }

    async fn count(&self, conditions: &Conditions) -> Result<u64> {
        let rows = self.rows.lock();
        Ok(rows.iter().filter(|row| matches(row, conditions)).count() as u64)
    }
}

/// Tier whose every operation fails, standing in for an unreachable Redis
pub struct FailingTier;

#[async_trait]
impl TierBackend for FailingTier {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(CacheError::Backend("tier unavailable".into()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
        Err(CacheError::Backend("tier unavailable".into()))
    }

    async fn del(&self, _keys: &[String]) -> Result<()> {
        Err(CacheError::Backend("tier unavailable".into()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Delivers published invalidations straight to attached registries, the way
/// a pub/sub channel would deliver them to every subscribed process.
#[derive(Default)]
pub struct LoopbackPublisher {
    subscribers: Mutex<Vec<CacheRegistry>>,
}

impl LoopbackPublisher {
    pub fn attach(&self, registry: &CacheRegistry) {
        self.subscribers.lock().push(registry.clone());
    }
}

#[async_trait]
impl InvalidationPublisher for LoopbackPublisher {
    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        let subscribers = self.subscribers.lock().clone();
        for registry in subscribers {
            registry.apply_invalidation(message).await;
        }
        Ok(())
    }
}
