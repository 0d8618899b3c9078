//! Near/shared tier composition.

use super::{CacheHit, CacheTier};
use crate::error::CacheError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Two-level cache: a fast near tier in front of an optional shared tier.
///
/// Reads try the near tier first; a shared-tier hit is copied into the near
/// tier with a TTL no longer than the shared entry's remaining life or the
/// near tier's cap. Writes go to every tier. A tier that fails is logged and
/// skipped, so a broken shared store degrades to near-tier-only caching.
pub struct TieredCache {
    near: Arc<dyn CacheTier>,
    shared: Option<Arc<dyn CacheTier>>,
    near_max_ttl: Duration,
}

impl TieredCache {
    pub fn new(
        near: Arc<dyn CacheTier>,
        shared: Option<Arc<dyn CacheTier>>,
        near_max_ttl: Duration,
    ) -> Self {
        Self {
            near,
            shared,
            near_max_ttl,
        }
    }

    fn near_ttl(&self, requested: Duration) -> Duration {
        requested.min(self.near_max_ttl)
    }
}

fn log_fault(tier: &dyn CacheTier, op: &str, key: &str, err: &CacheError) {
    warn!(tier = tier.name(), op, key, error = %err, "cache tier fault");
}

#[async_trait]
impl CacheTier for TieredCache {
    fn name(&self) -> &str {
        "tiered"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        match self.near.get(key).await {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(e) => log_fault(self.near.as_ref(), "get", key, &e),
        }

        let Some(shared) = &self.shared else {
            return Ok(None);
        };
        let hit = match shared.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                log_fault(shared.as_ref(), "get", key, &e);
                None
            }
        };

        if let Some(hit) = &hit {
            let ttl = self.near_ttl(hit.expires_in);
            debug!(key, ttl_ms = ttl.as_millis() as u64, "promoting shared hit to near tier");
            if let Err(e) = self.near.set(key, hit.value.clone(), ttl).await {
                log_fault(self.near.as_ref(), "set", key, &e);
            }
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        if let Some(shared) = &self.shared
            && let Err(e) = shared.set(key, value.clone(), ttl).await
        {
            log_fault(shared.as_ref(), "set", key, &e);
        }
        if let Err(e) = self.near.set(key, value, self.near_ttl(ttl)).await {
            log_fault(self.near.as_ref(), "set", key, &e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if let Err(e) = self.near.delete(key).await {
            log_fault(self.near.as_ref(), "delete", key, &e);
        }
        if let Some(shared) = &self.shared
            && let Err(e) = shared.delete(key).await
        {
            log_fault(shared.as_ref(), "delete", key, &e);
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.near.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryTier, SqliteTier};

    fn tiered(near_cap: Duration) -> (Arc<MemoryTier>, Arc<SqliteTier>, TieredCache) {
        let near = Arc::new(MemoryTier::new(16, 16));
        let shared = Arc::new(SqliteTier::in_memory(16).unwrap());
        let cache = TieredCache::new(near.clone(), Some(shared.clone()), near_cap);
        (near, shared, cache)
    }

    #[tokio::test]
    async fn test_write_populates_both_tiers() {
        let (near, shared, cache) = tiered(Duration::from_secs(30));
        cache
            .set("k", "v".into(), Duration::from_secs(600))
            .await
            .unwrap();
        let near_hit = near.get("k").await.unwrap().unwrap();
        assert!(near_hit.expires_in <= Duration::from_secs(30));
        let shared_hit = shared.get("k").await.unwrap().unwrap();
        assert!(shared_hit.expires_in > Duration::from_secs(500));
    }

    #[tokio::test]
    async fn test_shared_hit_promotes_to_near() {
        let (near, shared, cache) = tiered(Duration::from_secs(30));
        shared
            .set("k", "v".into(), Duration::from_secs(600))
            .await
            .unwrap();
        assert!(near.get("k").await.unwrap().is_none());

        let hit = cache.get("k").await.unwrap().unwrap();
        assert_eq!(hit.value, "v");
        let promoted = near.get("k").await.unwrap().unwrap();
        assert!(promoted.expires_in <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_miss_everywhere_is_none() {
        let (_, _, cache) = tiered(Duration::from_secs(30));
        assert!(cache.get("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_clears_all_tiers() {
        let (near, shared, cache) = tiered(Duration::from_secs(30));
        cache
            .set("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("k").await.unwrap();
        assert!(near.get("k").await.unwrap().is_none());
        assert!(shared.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_near_only() {
        let near = Arc::new(MemoryTier::new(4, 4));
        let cache = TieredCache::new(near, None, Duration::from_secs(10));
        cache
            .set("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());
        assert!(!cache.exists("other").await.unwrap());
    }
}
