//! Key options: how each indexable field of a table maps to cache keys
//!
//! Every cached field has a [`KeyOption`] made of three functions:
//! - a keyer turning a field value into a cache key
//! - a query loading the row with that field value from the record store
//! - a value extractor reading the field back out of a loaded row
//!
//! One option is the table's primary key; the others are unique secondary
//! fields. Anything not supplied in a [`KeySpec`] gets a default.

use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{CacheError, RecordStore, Result, record::single_row};

/// Prefix of every default cache key
pub const DEFAULT_KEY_PREFIX: &str = "Cached";

pub type Keyer = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub type QueryFn<S> = Arc<
    dyn for<'a> Fn(&'a S, &'a Value) -> BoxFuture<'a, Result<<S as RecordStore>::Entity>>
        + Send
        + Sync,
>;
pub type ValueFn<E> = Arc<dyn Fn(&E) -> Option<Value> + Send + Sync>;

/// Default cache key: `Cached#<table>#<field>#<value>`.
///
/// String values are rendered without JSON quotes, so `"a@x.com"` and `1` give
/// `Cached#users#email#a@x.com` and `Cached#users#id#1`.
pub fn default_key(table: &str, field: &str, value: &Value) -> String {
    match value {
        Value::String(s) => format!("{DEFAULT_KEY_PREFIX}#{table}#{field}#{s}"),
        other => format!("{DEFAULT_KEY_PREFIX}#{table}#{field}#{other}"),
    }
}

/// Per-field configuration; unset functions fall back to defaults.
pub struct KeySpec<S: RecordStore> {
    field: String,
    keyer: Option<Keyer>,
    query: Option<QueryFn<S>>,
    value_of: Option<ValueFn<S::Entity>>,
}

impl<S: RecordStore> KeySpec<S> {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            keyer: None,
            query: None,
            value_of: None,
        }
    }

    pub fn keyer<F>(mut self, keyer: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.keyer = Some(Arc::new(keyer));
        self
    }

    /// Custom loader, e.g. `|store, value| async move { ... }.boxed()`
    pub fn query<F>(mut self, query: F) -> Self
    where
        F: for<'a> Fn(&'a S, &'a Value) -> BoxFuture<'a, Result<S::Entity>> + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(query));
        self
    }

    pub fn value_of<F>(mut self, value_of: F) -> Self
    where
        F: Fn(&S::Entity) -> Option<Value> + Send + Sync + 'static,
    {
        self.value_of = Some(Arc::new(value_of));
        self
    }

    fn resolve(self, table: &str) -> KeyOption<S> {
        let field = self.field;
        KeyOption {
            keyer: self.keyer.unwrap_or_else(|| default_keyer(table, &field)),
            query: self.query.unwrap_or_else(|| default_query::<S>(field.clone())),
            value_of: self
                .value_of
                .unwrap_or_else(|| default_value_of::<S::Entity>(field.clone())),
            field,
        }
    }
}

/// A field's resolved key functions
pub struct KeyOption<S: RecordStore> {
    field: String,
    keyer: Keyer,
    query: QueryFn<S>,
    value_of: ValueFn<S::Entity>,
}

impl<S: RecordStore> Clone for KeyOption<S> {
    fn clone(&self) -> Self {
        Self {
            field: self.field.clone(),
            keyer: Arc::clone(&self.keyer),
            query: Arc::clone(&self.query),
            value_of: Arc::clone(&self.value_of),
        }
    }
}

impl<S: RecordStore> fmt::Debug for KeyOption<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyOption")
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

impl<S: RecordStore> KeyOption<S> {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn key(&self, value: &Value) -> String {
        (self.keyer)(value)
    }

    /// Load the row whose field equals `value`.
    pub async fn load(&self, store: &S, value: &Value) -> Result<S::Entity> {
        (self.query)(store, value).await
    }

    /// Read this option's field out of a loaded row.
    pub fn value_of(&self, entity: &S::Entity) -> Result<Value> {
        (self.value_of)(entity).ok_or_else(|| CacheError::MissingKeyValue {
            field: self.field.clone(),
        })
    }
}

fn default_keyer(table: &str, field: &str) -> Keyer {
    let table = table.to_owned();
    let field = field.to_owned();
    Arc::new(move |value: &Value| default_key(&table, &field, value))
}

fn query_fn<S, F>(query: F) -> QueryFn<S>
where
    S: RecordStore,
    F: for<'a> Fn(&'a S, &'a Value) -> BoxFuture<'a, Result<S::Entity>> + Send + Sync + 'static,
{
    Arc::new(query)
}

fn default_query<S: RecordStore>(field: String) -> QueryFn<S> {
    query_fn(move |store: &S, value: &Value| {
        let conditions = single_row(&field, value);
        async move { store.find(&conditions).await }.boxed()
    })
}

/// Reads `field` from the entity's JSON form; `null` counts as missing.
fn default_value_of<E: Serialize>(field: String) -> ValueFn<E> {
    Arc::new(move |entity: &E| match serde_json::to_value(entity) {
        Ok(Value::Object(mut map)) => map.remove(&field).filter(|v| !v.is_null()),
        _ => None,
    })
}

/// All key options of one table
pub struct KeySet<S: RecordStore> {
    table: String,
    primary: KeyOption<S>,
    items: BTreeMap<String, KeyOption<S>>,
}

impl<S: RecordStore> KeySet<S> {
    pub fn new(table: impl Into<String>, primary: KeySpec<S>) -> Self {
        let table = table.into();
        let primary = primary.resolve(&table);
        Self {
            table,
            primary,
            items: BTreeMap::new(),
        }
    }

    /// Register a unique secondary field
    pub fn with_key(mut self, spec: KeySpec<S>) -> Self {
        let option = spec.resolve(&self.table);
        self.items.insert(option.field.clone(), option);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary(&self) -> &KeyOption<S> {
        &self.primary
    }

    /// Option for `field`, built from defaults if it was never registered.
    pub fn option(&self, field: &str) -> KeyOption<S> {
        if field == self.primary.field {
            return self.primary.clone();
        }
        match self.items.get(field) {
            Some(option) => option.clone(),
            None => KeySpec::new(field).resolve(&self.table),
        }
    }

    /// The primary key and every secondary key, each built from `value`.
    pub fn keys(&self, value: &Value) -> Vec<String> {
        std::iter::once(&self.primary)
            .chain(self.items.values())
            .map(|option| option.key(value))
            .collect()
    }

    /// Every cache key that can refer to `entity`, each built from the row's
    /// own value for that field. Fields the row has no value for are skipped.
    pub fn keys_of(&self, entity: &S::Entity) -> Vec<String> {
        std::iter::once(&self.primary)
            .chain(self.items.values())
            .filter_map(|option| option.value_of(entity).ok().map(|v| option.key(&v)))
            .collect()
    }

    /// Keys of every registered field present in `row`.
    pub fn keys_in_row(&self, row: &serde_json::Map<String, Value>) -> Vec<String> {
        std::iter::once(&self.primary)
            .chain(self.items.values())
            .filter_map(|option| {
                row.get(&option.field)
                    .filter(|v| !v.is_null())
                    .map(|v| option.key(v))
            })
            .collect()
    }
}
