//! Cache error types

use redis::RedisError;
use std::sync::Arc;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tier backend failed for a reason other than Redis itself.
    #[error("Backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// The record store failed with anything other than "no such row".
    #[error("Record store error: {0}")]
    Store(Box<dyn std::error::Error + Send + Sync>),

    #[error("Not found")]
    NotFound,

    #[error("Loaded row has no value for key field `{field}`")]
    MissingKeyValue { field: String },

    /// Failure of a coalesced load, shared by its leader and every caller that
    /// waited on it. [`root`](Self::root) reaches the original error.
    #[error(transparent)]
    Shared(Arc<CacheError>),

    #[error("Load was cancelled before completing")]
    Cancelled,
}

impl CacheError {
    /// Wrap an arbitrary record store failure.
    pub fn store<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Store(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound)
    }

    /// The underlying error, looking through [`Shared`](Self::Shared).
    pub fn root(&self) -> &CacheError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T, E = CacheError> = std::result::Result<T, E>;
