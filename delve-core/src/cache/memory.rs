//! In-process near tier backed by an LRU map.

use super::{CacheEntry, CacheHit, CacheTier};
use crate::error::CacheError;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Most expired entries removed by a single write-triggered sweep.
const SWEEP_BATCH: usize = 256;

/// Most entries examined by a single sweep, starting from the least recently used.
const SWEEP_SCAN: usize = 1_024;

/// Fast in-process tier.
///
/// Holds at most `capacity` entries (least recently used evicted first).
/// Expired entries are dropped lazily on read, and a write sweeps a bounded
/// batch of expired entries once the item count passes `sweep_threshold`.
pub struct MemoryTier {
    entries: Mutex<LruCache<String, CacheEntry<String>>>,
    sweep_threshold: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize, sweep_threshold: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            sweep_threshold,
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry<String>>>, CacheError> {
        self.entries.lock().map_err(|e| CacheError::Backend {
            message: format!("memory tier lock poisoned: {e}"),
        })
    }

    /// Remove up to [`SWEEP_BATCH`] expired entries among the [`SWEEP_SCAN`]
    /// least recently used. Returns how many were removed.
    fn sweep(entries: &mut LruCache<String, CacheEntry<String>>, now: Instant) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .rev()
            .take(SWEEP_SCAN)
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .take(SWEEP_BATCH)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let live = match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(CacheHit {
                value: entry.value.clone(),
                expires_in: entry.expires_in(now),
            }),
            Some(_) => None,
            None => return Ok(None),
        };
        if live.is_none() {
            entries.pop(key);
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.lock()?;
        entries.put(key.to_string(), CacheEntry::new(value, ttl));
        if entries.len() > self.sweep_threshold {
            let removed = Self::sweep(&mut entries, Instant::now());
            if removed > 0 {
                debug!(removed, remaining = entries.len(), "swept expired memory entries");
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.pop(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.len())
    }
}
