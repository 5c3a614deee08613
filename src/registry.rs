//! Process-wide cache registry
//!
//! The registry owns everything that is shared between tables: the remote tier,
//! the coalescing table, the invalidation publisher, and the handles to each
//! table's local tier that incoming invalidations are applied to. It is built
//! explicitly and passed around, so tests can run several isolated "processes"
//! side by side.

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

use crate::{
    CacheConfig, LocalTier, RedisPublisher, RedisTier, RegistryConfig, Result, TierBackend,
    TieredStore,
    inflight::InFlightTable,
    pubsub::{InvalidationMessage, InvalidationPublisher},
};

/// Shared cache state for one process. Cheap to clone.
#[derive(Clone)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: RegistryConfig,
    remote: Option<Arc<dyn TierBackend>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    in_flight: Arc<InFlightTable>,
    locals: RwLock<HashMap<String, LocalTier>>,
}

/// Builder for [`CacheRegistry`]
#[derive(Default)]
pub struct CacheRegistryBuilder {
    config: Option<RegistryConfig>,
    remote: Option<Arc<dyn TierBackend>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
}

impl CacheRegistryBuilder {
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shared tier placed behind every table's local tier
    pub fn remote(mut self, remote: Arc<dyn TierBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn InvalidationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> CacheRegistry {
        CacheRegistry {
            inner: Arc::new(RegistryInner {
                config: self.config.unwrap_or_default(),
                remote: self.remote,
                publisher: self.publisher,
                in_flight: Arc::new(InFlightTable::default()),
                locals: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl CacheRegistry {
    pub fn builder() -> CacheRegistryBuilder {
        CacheRegistryBuilder::default()
    }

    /// Registry backed by Redis for both the remote tier and invalidation
    /// publishing. Pair it with an
    /// [`InvalidationListener`](crate::InvalidationListener) to receive
    /// invalidations from other processes.
    pub async fn connect(redis_client: redis::Client, config: RegistryConfig) -> Result<Self> {
        let manager = redis::aio::ConnectionManager::new(redis_client).await?;
        let publisher = RedisPublisher::new(manager.clone(), config.channel.clone());

        Ok(Self::builder()
            .config(config)
            .remote(Arc::new(RedisTier::from_manager(manager)))
            .publisher(Arc::new(publisher))
            .build())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Build the tiered store for `table`.
    ///
    /// With the local tier enabled, its handle is registered under `table` so
    /// that invalidations from other processes reach it. Building a second store
    /// for the same table replaces the registered handle.
    pub fn store(&self, table: impl Into<String>, config: CacheConfig) -> TieredStore {
        let table = table.into();
        let mut tiers: Vec<Arc<dyn TierBackend>> = Vec::with_capacity(2);

        if config.enable_local {
            let local = LocalTier::new(config.local_max_capacity);
            self.inner
                .locals
                .write()
                .insert(table.clone(), local.clone());
            tiers.push(Arc::new(local));
        }
        if let Some(remote) = &self.inner.remote {
            tiers.push(Arc::clone(remote));
        }
        if tiers.is_empty() {
            warn!("Cache for table {} has no tiers; every read will miss", table);
        }

        TieredStore::new(
            table,
            tiers,
            config,
            Arc::clone(&self.inner.in_flight),
            self.inner.publisher.clone(),
            self.inner.config.origin.clone(),
        )
    }

    /// Apply an invalidation payload received from the pub/sub channel.
    ///
    /// Only the local tier is touched; nothing is re-published.
    pub async fn handle_invalidation(&self, payload: &str) {
        let message: InvalidationMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unable to parse invalidation payload {}: {}", payload, e);
                return;
            }
        };
        self.apply_invalidation(&message).await;
    }

    pub async fn apply_invalidation(&self, message: &InvalidationMessage) {
        if self.inner.config.skip_own_messages && message.hostname == self.inner.config.origin {
            return;
        }

        let local = self.inner.locals.read().get(&message.table).cloned();
        match local {
            Some(local) => {
                local.invalidate(&message.keys).await;
                debug!(
                    "Local tier for {} invalidated keys {:?} from {}",
                    message.table, message.keys, message.hostname
                );
            }
            None => debug!("No local tier registered for table {}", message.table),
        }
    }
}
