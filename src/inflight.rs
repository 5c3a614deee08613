//! Per-key load coalescing
//!
//! The first caller to ask for a key becomes its leader and performs the load;
//! every concurrent caller for the same key waits on the leader's outcome
//! instead of issuing its own backend and record store round trips. Different
//! keys never wait on each other.

use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

use crate::{CacheError, Result};

/// Outcome of a load, shared with every waiter.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// Serialized value; each waiter decodes its own copy.
    Loaded(Bytes),
    NotFound,
    Failed(Arc<CacheError>),
    Cancelled,
}

type InFlightRx = watch::Receiver<Option<Outcome>>;
type InFlightTx = watch::Sender<Option<Outcome>>;

/// Table of loads currently in progress, keyed by cache key.
#[derive(Default)]
pub(crate) struct InFlightTable {
    calls: Mutex<HashMap<String, InFlightRx>>,
}

pub(crate) enum Admission {
    Leader(InFlightGuard),
    Waiter(Waiter),
}

impl InFlightTable {
    /// Join the load for `key`, or start one if none is running.
    pub(crate) fn admit(self: &Arc<Self>, key: &str) -> Admission {
        let mut calls = self.calls.lock();
        if let Some(rx) = calls.get(key) {
            return Admission::Waiter(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        calls.insert(key.to_owned(), rx);
        Admission::Leader(InFlightGuard {
            key: key.to_owned(),
            table: Arc::clone(self),
            tx: Some(tx),
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Held by the leader of a load.
///
/// Dropping the guard without completing it (the leader's future was dropped or
/// panicked) releases the key and tells waiters the load was cancelled.
pub(crate) struct InFlightGuard {
    key: String,
    table: Arc<InFlightTable>,
    tx: Option<InFlightTx>,
}

impl InFlightGuard {
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    /// Report a failed load to the waiters and hand the error back to the leader.
    ///
    /// `NotFound` and `Cancelled` pass through as themselves. Anything else is
    /// shared; the leader gets it back unwrapped unless a waiter still holds it,
    /// in which case it gets the same [`CacheError::Shared`] the waiters see.
    pub(crate) fn fail(self, err: CacheError) -> CacheError {
        match err {
            CacheError::NotFound => {
                self.complete(Outcome::NotFound);
                CacheError::NotFound
            }
            CacheError::Cancelled => {
                self.complete(Outcome::Cancelled);
                CacheError::Cancelled
            }
            other => {
                let shared = Arc::new(other);
                self.complete(Outcome::Failed(Arc::clone(&shared)));
                Arc::try_unwrap(shared).unwrap_or_else(CacheError::Shared)
            }
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        // Release the key before publishing so callers arriving afterwards start a
        // fresh load instead of reading a finished one.
        if let Some(tx) = self.tx.take() {
            self.table.calls.lock().remove(&self.key);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.finish(Outcome::Cancelled);
    }
}

/// Held by a caller waiting on someone else's load.
pub(crate) struct Waiter {
    rx: InFlightRx,
}

impl Waiter {
    pub(crate) async fn outcome(mut self) -> Result<Bytes> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => return Err(CacheError::Cancelled),
        };
        match outcome {
            Some(Outcome::Loaded(bytes)) => Ok(bytes),
            Some(Outcome::NotFound) => Err(CacheError::NotFound),
            Some(Outcome::Failed(err)) => Err(CacheError::Shared(err)),
            Some(Outcome::Cancelled) | None => Err(CacheError::Cancelled),
        }
    }
}
