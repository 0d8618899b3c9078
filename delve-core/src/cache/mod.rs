//! Layered result cache for search responses and reliability assessments.
//!
//! A cache is a stack of [`CacheTier`]s (fastest first). Values are stored
//! as JSON text so every tier, including an out-of-process one, can hold
//! any serializable result. [`ResultCache`] is the typed facade the engine
//! uses: it never returns an error, since a tier fault is just a miss.

pub mod memory;
pub mod sqlite;
pub mod tiered;

pub use memory::MemoryTier;
pub use sqlite::SqliteTier;
pub use tiered::TieredCache;

use crate::config::CacheConfig;
use crate::error::CacheError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A stored value with its creation time and time-to-live.
///
/// Visible only while `now < created_at + ttl`.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// Compares ages instead of computing `created_at + ttl`, so any TTL up
    /// to `Duration::MAX` is accepted.
    pub fn is_live(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }

    /// Time left before expiry, zero once expired.
    pub fn expires_in(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(self.age(now))
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// A value read from a tier, with the time it has left.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: String,
    pub expires_in: Duration,
}

/// One layer of the cache.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Fetch a live entry. Expired entries are removed and reported absent.
    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Number of physically stored entries, expired ones included.
    async fn len(&self) -> Result<usize, CacheError>;
}

/// Aggregate cache performance metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Tier faults that were downgraded to misses.
    pub faults: u64,
}

impl CacheMetrics {
    /// Compute the hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn accumulate(&mut self, other: &CacheMetrics) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.faults += other.faults;
    }
}

/// Derive a cache key from a namespace and an ordered list of parts.
///
/// Parts are hashed with SHA-256 so keys stay short regardless of input size.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{namespace}:{}", hex(&hasher.finalize()))
}

/// Hex-encoded SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    hex(&Sha256::digest(text.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Typed facade over a cache backend.
///
/// Serialization failures and tier faults are logged and counted, then
/// treated as a miss. A disabled cache misses on every read and drops writes.
pub struct ResultCache {
    backend: Option<Arc<dyn CacheTier>>,
    hits: AtomicU64,
    misses: AtomicU64,
    faults: AtomicU64,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheTier>) -> Self {
        Self {
            backend: Some(backend),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            backend: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// An in-process cache with the default capacity.
    pub fn in_memory() -> Self {
        let config = CacheConfig::default();
        Self::new(Arc::new(TieredCache::new(
            Arc::new(MemoryTier::new(
                config.near_max_entries,
                config.sweep_threshold,
            )),
            None,
            config.near_max_ttl(),
        )))
    }

    /// Build the tier stack described by `config`.
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let near = Arc::new(MemoryTier::new(
            config.near_max_entries.max(1),
            config.sweep_threshold,
        ));
        let shared: Option<Arc<dyn CacheTier>> = match &config.shared_path {
            Some(path) => Some(Arc::new(SqliteTier::open(path, config.sweep_threshold)?)),
            None => None,
        };
        Ok(Self::new(Arc::new(TieredCache::new(
            near,
            shared,
            config.near_max_ttl(),
        ))))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(backend) = &self.backend else {
            return None;
        };
        let hit = match backend.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                self.record_fault(backend.name(), key, &e);
                None
            }
        };
        let Some(hit) = hit else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache miss");
            return None;
        };
        match serde_json::from_str(&hit.value) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache hit");
                Some(value)
            }
            Err(e) => {
                let err = CacheError::Serialization {
                    message: e.to_string(),
                };
                self.record_fault(backend.name(), key, &err);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                let err = CacheError::Serialization {
                    message: e.to_string(),
                };
                self.record_fault(backend.name(), key, &err);
                return;
            }
        };
        if let Err(e) = backend.set(key, encoded, ttl).await {
            self.record_fault(backend.name(), key, &e);
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(backend) = &self.backend
            && let Err(e) = backend.delete(key).await
        {
            self.record_fault(backend.name(), key, &e);
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                self.record_fault(backend.name(), key, &e);
                false
            }
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    fn record_fault(&self, tier: &str, key: &str, err: &CacheError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        warn!(tier, key, error = %err, "cache fault treated as miss");
    }
}
