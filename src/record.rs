//! Record store interface
//!
//! The relational layer underneath the cache. It is consumed only through this
//! narrow trait: rows are addressed by flat field to value condition maps, and
//! the query builder behind it is not this crate's concern.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{Cacheable, Result};

/// Field to value equality conditions
pub type Conditions = Map<String, Value>;

/// Column values for inserts and updates
pub type Row = Map<String, Value>;

/// Reserved condition key selecting `[count]` or `[offset, count]`
pub const LIMIT_KEY: &str = "_limit";

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Access to one table of the relational store.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Row type of this table
    type Entity: Cacheable;

    fn table(&self) -> &str;

    /// Load the first row matching `conditions`.
    ///
    /// Must return [`CacheError::NotFound`](crate::CacheError::NotFound) when no row
    /// matches; that error alone is eligible for negative caching.
    async fn find(&self, conditions: &Conditions) -> Result<Self::Entity>;

    async fn insert(&self, data: Row) -> Result<ExecResult>;

    async fn update(&self, changes: Row, conditions: &Conditions) -> Result<ExecResult>;

    async fn delete(&self, conditions: &Conditions) -> Result<ExecResult>;

    async fn count(&self, conditions: &Conditions) -> Result<u64>;
}

/// Conditions selecting the single row whose `field` equals `value`.
pub fn single_row(field: &str, value: &Value) -> Conditions {
    let mut conditions = Conditions::new();
    conditions.insert(field.to_owned(), value.clone());
    conditions.insert(LIMIT_KEY.to_owned(), Value::from(vec![1u64]));
    conditions
}
