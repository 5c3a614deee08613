//! Cache configuration

use std::time::Duration;

/// Default pub/sub channel carrying local-tier invalidations
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "model.cached.delete";

/// Configuration for one table's tiered store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Keep an in-process tier in front of the remote one
    pub enable_local: bool,
    /// Maximum number of entries in the local tier
    pub local_max_capacity: u64,
    /// Time-to-live for found values
    pub expiration: Duration,
    /// Time-to-live for not-found placeholders
    pub not_found_expiration: Duration,
    /// Relative jitter applied to `expiration` (0.05 means +/-5%).
    /// Placeholders are never jittered.
    pub expiry_deviation: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_local: true,
            local_max_capacity: 10_000,
            expiration: Duration::from_secs(60 * 60),          // 1 hour
            not_found_expiration: Duration::from_secs(2 * 60), // 2 minutes
            expiry_deviation: 0.05,
        }
    }
}

/// Configuration for a cached model (the consistency layer)
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Extra lifetime given to a primary entry written by a secondary-key load,
    /// so it outlives the secondary entry pointing at it
    pub safety_gap: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            safety_gap: Duration::from_secs(5),
        }
    }
}

/// Configuration for the process-wide cache registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Identifies this process in invalidation messages
    pub origin: String,
    /// Pub/sub channel for invalidation messages
    pub channel: String,
    /// Ignore invalidations published by this same origin
    pub skip_own_messages: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let origin = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("pid-{}", std::process::id()));

        Self {
            origin,
            channel: DEFAULT_INVALIDATION_CHANNEL.to_owned(),
            skip_own_messages: true,
        }
    }
}
