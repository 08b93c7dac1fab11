use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::addr::{AddressSet, QueryKey, Resolution};
use crate::backend::{self, Backend, Fallback, Upstream};
use crate::cache::{AddrCache, Freshness, TtlPolicy};
use crate::cipher::NameCipher;
use crate::config::SdnsConfig;
use crate::error::{ConfigError, ResolveError};
use crate::prefetch::{self, PrefetchList, Refresh};

type FlightResult = Result<Resolution, ResolveError>;
type InflightMap = DashMap<QueryKey, Arc<Flight>, FxBuildHasher>;

/// One backend call shared by every caller of the same key.
#[derive(Default)]
struct Flight {
    state: Mutex<FlightState>,
}

#[derive(Default)]
struct FlightState {
    waiters: Vec<oneshot::Sender<FlightResult>>,
    // 被 flush/destroy 摘除：结果照常返回，但不写缓存
    detached: bool,
}

impl Flight {
    fn detach(&self) {
        self.state.lock().detached = true;
    }
}

/// 解析环境：缓存、后端与预取任务 / Resolution environment.
///
/// Cheap to clone; all clones share one cache and one prefetch worker.
/// Configuration is fixed at [`SdnsEnv::init`]; to change it, `destroy` and
/// initialize a new environment.
#[derive(Clone)]
pub struct SdnsEnv {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    active: AtomicBool,
    cache: AddrCache,
    policy: TtlPolicy,
    upstream: Upstream,
    prefetch: Arc<PrefetchList>,
    // In-flight dedupe: key -> shared call / 进行中的去重映射
    inflight: InflightMap,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

#[derive(Default)]
struct Metrics {
    total_requests: AtomicU64,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    prefetch_enqueued: AtomicU64,
    coalesced: AtomicU64,
}

/// Snapshot returned by [`SdnsEnv::cache_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub entries: u64,
    pub memory: u64,
    pub max_memory: u64,
    pub total_requests: u64,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub prefetch_enqueued: u64,
    /// Jobs waiting for the scheduler.
    pub prefetch_queued: usize,
    /// Queued plus running refreshes.
    pub prefetch_pending: usize,
    pub upstream: String,
    pub upstream_calls: u64,
    pub upstream_failures: u64,
    pub upstream_avg: Duration,
    pub last_upstream_error: Option<u16>,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} memory={}/{} total={} hits={} stale_hits={} misses={} coalesced={} prefetch_enqueued={} prefetch_queued={} prefetch_pending={} upstream={} upstream_calls={} upstream_failures={} upstream_avg_us={:.1}",
            self.entries,
            self.memory,
            self.max_memory,
            self.total_requests,
            self.hits,
            self.stale_hits,
            self.misses,
            self.coalesced,
            self.prefetch_enqueued,
            self.prefetch_queued,
            self.prefetch_pending,
            self.upstream,
            self.upstream_calls,
            self.upstream_failures,
            self.upstream_avg.as_nanos() as f64 / 1000.0,
        )?;
        if let Some(code) = self.last_upstream_error {
            write!(f, " last_upstream_error={code}")?;
        }
        Ok(())
    }
}

impl SdnsEnv {
    /// Validates `config`, builds the configured backend(s), allocates the cache
    /// and starts the prefetch worker on the current tokio runtime.
    pub fn init(config: SdnsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cipher = config
            .cipher
            .as_ref()
            .map(|c| NameCipher::new(c.id, &c.key))
            .transpose()?;
        let primary = backend::build_backend(&config.backend, "backend", cipher.clone())?;
        let backend: Arc<dyn Backend> = match &config.fallback {
            Some(fallback) => {
                let secondary = backend::build_backend(fallback, "fallback", cipher)?;
                Arc::new(Fallback::new(primary, secondary, config.backend.timeout()))
            }
            None => primary,
        };
        Self::with_backend(config, backend)
    }

    /// Like [`SdnsEnv::init`] but with a caller-supplied backend; the
    /// `backend`/`fallback`/`cipher` sections of `config` are ignored.
    pub fn with_backend(config: SdnsConfig, backend: Arc<dyn Backend>) -> Result<Self, ConfigError> {
        config.validate_cache()?;

        let policy = TtlPolicy::from_settings(&config.cache, &config.prefetch);
        let inner = Arc::new(EnvInner {
            active: AtomicBool::new(true),
            cache: AddrCache::new(config.cache.max_memory),
            policy,
            upstream: Upstream::new(backend, policy),
            prefetch: Arc::new(PrefetchList::new()),
            inflight: DashMap::with_hasher(FxBuildHasher),
            worker: Mutex::new(None),
            metrics: Metrics::default(),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let worker = handle.spawn(prefetch::run_worker(
                    Arc::downgrade(&inner),
                    Arc::clone(&inner.prefetch),
                ));
                *inner.worker.lock() = Some(worker);
            }
            Err(_) => {
                warn!(target = "prefetch", "no tokio runtime, prefetch jobs run only via run_prefetch()");
            }
        }

        info!(
            upstream = %inner.upstream.label(),
            max_memory = config.cache.max_memory,
            min_ttl = config.cache.min_ttl,
            prefetch = config.prefetch.enabled,
            "sdns environment initialized"
        );
        Ok(Self { inner })
    }

    /// Stops the prefetch worker and frees every cache entry and job.
    /// Later lookups fail with `NotInitialized`. Safe to call repeatedly.
    pub fn destroy(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }
        self.inner.prefetch.clear();
        // running calls still answer their callers but must not write back
        for flight in self.inner.inflight.iter() {
            flight.value().detach();
        }
        self.inner.inflight.clear();
        self.inner.cache.clear();
        info!("sdns environment destroyed");
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<(), ResolveError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ResolveError::NotInitialized)
        }
    }

    /// Resolves `name` through the cache. Fresh and near-expiry hits never touch
    /// the network; near-expiry hits also queue a background refresh.
    pub async fn resolve_addresses(&self, name: &str) -> Result<AddressSet, ResolveError> {
        self.ensure_active()?;
        let key = QueryKey::new(name)?;
        let inner = &self.inner;
        inner.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        if let Some(hit) = inner.cache.get(&key) {
            match hit.freshness(start) {
                Freshness::Fresh => {
                    inner.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(event = "dns_lookup", qname = %key, cache = true, "cache hit");
                    return Ok(hit.addrs.clone());
                }
                Freshness::Stale => {
                    inner.metrics.stale_hits.fetch_add(1, Ordering::Relaxed);
                    if inner.prefetch.enqueue(&key) {
                        inner.metrics.prefetch_enqueued.fetch_add(1, Ordering::Relaxed);
                        debug!(event = "dns_lookup", qname = %key, cache = true, "stale hit, prefetch queued");
                    }
                    return Ok(hit.addrs.clone());
                }
                Freshness::Expired => {
                    debug!(event = "dns_lookup", qname = %key, "cached entry expired");
                }
            }
        }

        inner.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let resolution = inner.fetch(&key).await?;
        info!(
            event = "dns_response",
            upstream = %inner.upstream.label(),
            qname = %key,
            addrs = resolution.addrs.len(),
            ttl = resolution.ttl,
            latency_ms = start.elapsed().as_millis() as u64,
            cache = false,
            "resolved"
        );
        Ok(resolution.addrs)
    }

    /// Removes `name` from the cache and drops any queued refresh for it.
    ///
    /// A backend call already running for `name` is detached: its callers still
    /// get the answer, but it is not written back, and the next lookup starts a
    /// new call.
    pub fn flush_cache(&self, name: &str) -> Result<bool, ResolveError> {
        self.ensure_active()?;
        let key = QueryKey::new(name)?;
        self.inner.prefetch.cancel(&key);
        if let Some((_, flight)) = self.inner.inflight.remove(&key) {
            flight.detach();
        }
        // detach first: a write-back that won the race is removed here
        let removed = self.inner.cache.remove(&key).is_some();
        debug!(qname = %key, removed, "cache flush");
        Ok(removed)
    }

    pub fn cache_status(&self) -> CacheStatus {
        let inner = &self.inner;
        let stats = inner.cache.stats();
        let m = &inner.metrics;
        CacheStatus {
            entries: stats.entries,
            memory: stats.memory,
            max_memory: inner.cache.ceiling(),
            total_requests: m.total_requests.load(Ordering::Relaxed),
            hits: m.hits.load(Ordering::Relaxed),
            stale_hits: m.stale_hits.load(Ordering::Relaxed),
            misses: m.misses.load(Ordering::Relaxed),
            coalesced: m.coalesced.load(Ordering::Relaxed),
            prefetch_enqueued: m.prefetch_enqueued.load(Ordering::Relaxed),
            prefetch_queued: inner.prefetch.queued(),
            prefetch_pending: inner.prefetch.len(),
            upstream: inner.upstream.label().to_string(),
            upstream_calls: inner.upstream.calls(),
            upstream_failures: inner.upstream.failures(),
            upstream_avg: inner.upstream.avg_latency(),
            last_upstream_error: inner.upstream.last_error_code(),
        }
    }

    /// True while a refresh for `name` is queued or in flight.
    pub fn is_prefetch_pending(&self, name: &str) -> bool {
        QueryKey::new(name).is_ok_and(|key| self.inner.prefetch.contains(&key))
    }

    /// Processes queued prefetch jobs now, for hosts that drive the scheduler
    /// themselves. Returns the number of jobs run.
    pub async fn run_prefetch(&self) -> Result<usize, ResolveError> {
        self.ensure_active()?;
        Ok(prefetch::process_pending(&self.inner.prefetch, Arc::clone(&self.inner)).await)
    }
}

/// Removes the flight from the map (unless a newer one replaced it) and hands
/// out its waiters. Dropped without `finish`, the waiters see `Interrupted`.
struct InflightCleanupGuard<'a> {
    inflight: &'a InflightMap,
    key: &'a QueryKey,
    flight: &'a Arc<Flight>,
}

impl InflightCleanupGuard<'_> {
    fn take_waiters(&self) -> Vec<oneshot::Sender<FlightResult>> {
        self.inflight
            .remove_if(self.key, |_, current| Arc::ptr_eq(current, self.flight));
        std::mem::take(&mut self.flight.state.lock().waiters)
    }

    fn finish(self, result: &FlightResult) {
        for tx in self.take_waiters() {
            let _ = tx.send(result.clone());
        }
    }
}

impl Drop for InflightCleanupGuard<'_> {
    fn drop(&mut self) {
        drop(self.take_waiters());
    }
}

impl EnvInner {
    /// Backend call plus write-through. At most one call per key is in flight;
    /// concurrent callers for the same key wait for the same result. The call
    /// runs in its own task, so a cancelled caller never cancels it for the
    /// others.
    async fn fetch(self: &Arc<Self>, key: &QueryKey) -> FlightResult {
        let (tx, rx) = oneshot::channel();
        let leader = match self.inflight.entry(key.clone()) {
            Entry::Occupied(slot) => {
                slot.get().state.lock().waiters.push(tx);
                None
            }
            Entry::Vacant(slot) => {
                let flight = Arc::new(Flight::default());
                flight.state.lock().waiters.push(tx);
                slot.insert(Arc::clone(&flight));
                Some(flight)
            }
        };
        match leader {
            Some(flight) => {
                tokio::spawn(Arc::clone(self).lead(key.clone(), flight));
            }
            None => {
                self.metrics.coalesced.fetch_add(1, Ordering::Relaxed);
            }
        }
        rx.await.unwrap_or(Err(ResolveError::Interrupted))
    }

    async fn lead(self: Arc<Self>, key: QueryKey, flight: Arc<Flight>) {
        let guard = InflightCleanupGuard {
            inflight: &self.inflight,
            key: &key,
            flight: &flight,
        };
        let result = self.upstream.fetch(&key).await;
        if let Ok(resolution) = &result {
            // flush/destroy detach under the same lock, then drop the entry
            let state = flight.state.lock();
            if !state.detached && self.active.load(Ordering::SeqCst) {
                let entry = self.policy.entry(key.clone(), resolution.clone(), Instant::now());
                if let Err(err) = self.cache.put(entry) {
                    warn!(qname = %key, error = %err, "cache rejected entry");
                }
            } else {
                debug!(qname = %key, "flushed while in flight, result not cached");
            }
        }
        // publish to waiters only after the cache holds the new entry
        guard.finish(&result);
    }
}

#[async_trait]
impl Refresh for EnvInner {
    async fn refresh(self: Arc<Self>, key: &QueryKey) -> Result<(), ResolveError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(ResolveError::NotInitialized);
        }
        self.fetch(key).await.map(|_| ())
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
