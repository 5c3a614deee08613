//! Cross-process local-tier invalidation over Redis pub/sub
//!
//! Every process keeps its own [`LocalTier`](crate::LocalTier) in front of a shared
//! remote tier. When a process evicts keys it publishes an
//! [`InvalidationMessage`]; every subscribed process drops the same keys from its
//! own local tier and never re-publishes them. Delivery is best-effort: local
//! tier expiry bounds staleness when a message is lost.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::{thread, time::Duration};
use tokio::{runtime::Builder, sync::watch};
use tracing::{debug, error, warn};

use crate::{CacheRegistry, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Payload published on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvalidationMessage {
    /// Origin of the eviction
    pub hostname: String,
    pub table: String,
    pub keys: Vec<String>,
}

/// Sends invalidation messages to other processes.
#[async_trait]
pub trait InvalidationPublisher: Send + Sync {
    async fn publish(&self, message: &InvalidationMessage) -> Result<()>;
}

/// Publishes invalidations on a Redis channel
#[derive(Clone)]
pub struct RedisPublisher {
    redis: redis::aio::ConnectionManager,
    channel: String,
}

impl RedisPublisher {
    pub fn new(redis: redis::aio::ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            redis,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl InvalidationPublisher for RedisPublisher {
    async fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

/// Background subscriber feeding invalidation messages into a registry.
///
/// Runs on its own thread with a dedicated current-thread runtime, so it keeps
/// working regardless of which runtime the caches are used from.
pub struct InvalidationListener {
    shutdown: watch::Sender<bool>,
    _handle: thread::JoinHandle<()>,
}

impl InvalidationListener {
    /// Subscribe to the registry's invalidation channel in the background.
    ///
    /// The subscriber reconnects with exponential back-off whenever the
    /// subscription drops, until [`shutdown`](Self::shutdown) is called or the
    /// listener is dropped.
    pub fn spawn(redis_client: redis::Client, registry: CacheRegistry) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = thread::spawn(move || {
            match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt.block_on(listen(redis_client, registry, shutdown_rx)),
                Err(e) => error!("Invalidation listener: failed to build runtime: {}", e),
            }
        });
        Self {
            shutdown,
            _handle: handle,
        }
    }

    /// Signal the subscriber to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(
    redis_client: redis::Client,
    registry: CacheRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let channel = registry.config().channel.clone();
    let mut delay = INITIAL_BACKOFF;

    while !*shutdown.borrow() {
        let mut pubsub = match redis_client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!("Invalidation listener: failed to open pub/sub connection: {}", e);
                if backoff(&mut shutdown, &mut delay).await {
                    return;
                }
                continue;
            }
        };

        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!("Invalidation listener: subscribe to {} failed: {}", channel, e);
            if backoff(&mut shutdown, &mut delay).await {
                return;
            }
            continue;
        }
        debug!("Invalidation listener: subscribed to channel {}", channel);
        delay = INITIAL_BACKOFF;

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => registry.handle_invalidation(&payload).await,
                        Err(e) => warn!("Invalidation listener: undecodable payload: {}", e),
                    },
                    None => {
                        warn!("Invalidation listener: subscription on {} closed; reconnecting", channel);
                        break;
                    }
                },
            }
        }
    }
}

/// Sleep for the current back-off, doubling it. Returns true on shutdown.
async fn backoff(shutdown: &mut watch::Receiver<bool>, delay: &mut Duration) -> bool {
    let wait = *delay;
    *delay = delay.saturating_mul(2).min(MAX_BACKOFF);
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let message = InvalidationMessage {
            hostname: "web-1".to_owned(),
            table: "users".to_owned(),
            keys: vec!["Cached#users#id#1".to_owned()],
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Hostname": "web-1",
                "Table": "users",
                "Keys": ["Cached#users#id#1"],
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_up_to_cap() {
        let (_tx, mut rx) = watch::channel(false);
        let mut delay = INITIAL_BACKOFF;
        for _ in 0..10 {
            assert!(!backoff(&mut rx, &mut delay).await);
        }
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_backoff_stops_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let mut delay = Duration::from_secs(60);
        tx.send(true).unwrap();
        assert!(backoff(&mut rx, &mut delay).await);
    }
}
