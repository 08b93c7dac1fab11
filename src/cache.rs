use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tokio::time::Instant;

use crate::addr::{AddressSet, QueryKey, Resolution};
use crate::config::{CacheSettings, PrefetchSettings};
use crate::error::ResolveError;

/// Fixed per-entry bookkeeping charged on top of name and address bytes.
pub const ENTRY_OVERHEAD: u64 = 96;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub addrs: AddressSet,
    /// Hard expiry.
    pub ttl: Instant,
    /// Refresh trigger, never later than `ttl`.
    pub prefetch_ttl: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past `prefetch_ttl` but still servable.
    Stale,
    Expired,
}

impl CacheEntry {
    #[inline]
    pub fn freshness(&self, now: Instant) -> Freshness {
        if now >= self.ttl {
            Freshness::Expired
        } else if now >= self.prefetch_ttl {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Estimated memory footprint used for the cache ceiling.
    #[inline]
    pub fn weight(&self) -> u64 {
        entry_weight(&self.key, &self.addrs)
    }
}

#[inline]
fn entry_weight(key: &QueryKey, addrs: &AddressSet) -> u64 {
    ENTRY_OVERHEAD + key.name().len() as u64 + addrs.byte_len() as u64
}

/// Turns upstream TTLs into absolute `ttl` / `prefetch_ttl` instants.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub prefetch: bool,
    pub threshold_percent: u8,
}

impl TtlPolicy {
    pub fn from_settings(cache: &CacheSettings, prefetch: &PrefetchSettings) -> Self {
        Self {
            min_ttl: cache.min_ttl,
            max_ttl: cache.max_ttl,
            prefetch: prefetch.enabled,
            threshold_percent: prefetch.threshold_percent.min(100),
        }
    }

    #[inline]
    pub fn clamp(&self, ttl: u32) -> u32 {
        ttl.clamp(self.min_ttl, self.max_ttl.max(self.min_ttl))
    }

    /// How long before hard expiry a refresh is triggered.
    #[inline]
    pub fn prefetch_lead(&self, ttl: u32) -> Duration {
        if !self.prefetch {
            return Duration::ZERO;
        }
        Duration::from_secs(ttl as u64) * u32::from(self.threshold_percent) / 100
    }

    pub fn entry(&self, key: QueryKey, resolution: Resolution, now: Instant) -> CacheEntry {
        let ttl = self.clamp(resolution.ttl);
        let lifetime = Duration::from_secs(ttl as u64);
        let expires = now + lifetime;
        let prefetch_at = expires - self.prefetch_lead(ttl).min(lifetime);
        CacheEntry {
            key,
            addrs: resolution.addrs,
            ttl: expires,
            prefetch_ttl: prefetch_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: u64,
    pub memory: u64,
}

/// 按内存上限淘汰的 LRU 地址缓存 / LRU address cache bounded by memory.
#[derive(Clone)]
pub struct AddrCache {
    inner: Cache<QueryKey, Arc<CacheEntry>>,
    ceiling: u64,
}

impl AddrCache {
    pub fn new(max_memory: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_memory)
            .weigher(|key: &QueryKey, entry: &Arc<CacheEntry>| -> u32 {
                entry_weight(key, &entry.addrs).try_into().unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            inner,
            ceiling: max_memory,
        }
    }

    #[inline]
    pub fn get(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        self.inner.get(key)
    }

    /// Inserts or replaces, then evicts least-recently-used entries until the
    /// estimate is back under the ceiling.
    pub fn put(&self, entry: CacheEntry) -> Result<(), ResolveError> {
        let size = entry.weight();
        if size > self.ceiling {
            return Err(ResolveError::ResourceExhausted {
                size,
                ceiling: self.ceiling,
            });
        }
        self.inner.insert(entry.key.clone(), Arc::new(entry));
        self.inner.run_pending_tasks();
        Ok(())
    }

    pub fn remove(&self, key: &QueryKey) -> Option<Arc<CacheEntry>> {
        let removed = self.inner.remove(key);
        self.inner.run_pending_tasks();
        removed
    }

    pub fn clear(&self) {
        // invalidate_all() removes lazily; drop each entry so stats reflect it now.
        for (key, _) in self.inner.iter() {
            self.inner.invalidate(key.as_ref());
        }
        self.inner.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks();
        CacheStats {
            entries: self.inner.entry_count(),
            memory: self.inner.weighted_size(),
        }
    }

    #[inline]
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }
}
