use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::addr::{QueryKey, Resolution};
use crate::cache::TtlPolicy;
use crate::cipher::NameCipher;
use crate::config::{BackendConfig, BackendKind};
use crate::error::{ConfigError, ResolveError};

pub mod http;
pub mod wire;

pub use http::HttpBackend;
pub use wire::WireBackend;

/// A transport able to turn a name into addresses plus a TTL.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    async fn resolve(&self, key: &QueryKey) -> Result<Resolution, ResolveError>;
}

/// Runs `fut` until `deadline`; expiry becomes `ResolveError::Timeout(budget)`.
///
/// Everything the future owns (sockets, connection tasks) is dropped on every
/// exit path, including expiry.
pub async fn with_deadline<F, T>(deadline: Instant, budget: Duration, fut: F) -> Result<T, ResolveError>
where
    F: Future<Output = Result<T, ResolveError>>,
{
    match timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(ResolveError::Timeout(budget)),
    }
}

pub fn build_backend(
    cfg: &BackendConfig,
    role: &'static str,
    cipher: Option<NameCipher>,
) -> Result<Arc<dyn Backend>, ConfigError> {
    let server = cfg.endpoint(role)?;
    Ok(match cfg.kind {
        BackendKind::Dns => Arc::new(WireBackend::new(server, cfg.timeout(), cfg.transport, cfg.family)),
        BackendKind::Http => Arc::new(HttpBackend::new(server, cfg.timeout(), cipher)),
    })
}

/// Primary backend with one fallback endpoint (the public DNS server).
///
/// Both attempts share one deadline of `budget`, so a lookup never waits longer
/// than a single backend timeout. The fallback therefore only gets whatever time
/// the primary left over, e.g. after a refused connection or an error status.
pub struct Fallback {
    primary: Arc<dyn Backend>,
    secondary: Arc<dyn Backend>,
    budget: Duration,
    label: String,
}

impl Fallback {
    pub fn new(primary: Arc<dyn Backend>, secondary: Arc<dyn Backend>, budget: Duration) -> Self {
        let label = format!("{}+{}", primary.label(), secondary.label());
        Self {
            primary,
            secondary,
            budget,
            label,
        }
    }
}

#[async_trait]
impl Backend for Fallback {
    fn label(&self) -> &str {
        &self.label
    }

    async fn resolve(&self, key: &QueryKey) -> Result<Resolution, ResolveError> {
        let deadline = Instant::now() + self.budget;
        with_deadline(deadline, self.budget, async {
            match self.primary.resolve(key).await {
                Ok(res) => Ok(res),
                Err(err) => {
                    debug!(
                        event = "backend_fallback",
                        qname = %key,
                        primary = %self.primary.label(),
                        secondary = %self.secondary.label(),
                        error = %err,
                        "primary backend failed, trying fallback"
                    );
                    self.secondary.resolve(key).await
                }
            }
        })
        .await
    }
}

/// Single entry point to whichever backend is configured. Normalizes results
/// (TTL floor/ceiling, non-empty sets) and keeps call counters.
pub struct Upstream {
    backend: Arc<dyn Backend>,
    policy: TtlPolicy,
    calls: AtomicU64,
    failures: AtomicU64,
    upstream_ns_total: AtomicU64,
    // 0 = none seen
    last_error_code: AtomicU32,
}

impl Upstream {
    pub fn new(backend: Arc<dyn Backend>, policy: TtlPolicy) -> Self {
        Self {
            backend,
            policy,
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            upstream_ns_total: AtomicU64::new(0),
            last_error_code: AtomicU32::new(0),
        }
    }

    pub fn label(&self) -> &str {
        self.backend.label()
    }

    pub async fn fetch(&self, key: &QueryKey) -> Result<Resolution, ResolveError> {
        let start = Instant::now();
        self.calls.fetch_add(1, Ordering::Relaxed);
        let res = self.backend.resolve(key).await.and_then(|res| {
            if res.addrs.is_empty() {
                return Err(ResolveError::NoAnswer(key.to_string()));
            }
            Ok(Resolution {
                ttl: self.policy.clamp(res.ttl),
                addrs: res.addrs,
            })
        });
        let dur = start.elapsed();
        match &res {
            Ok(resolution) => {
                self.upstream_ns_total
                    .fetch_add(dur.as_nanos() as u64, Ordering::Relaxed);
                debug!(
                    upstream = %self.backend.label(),
                    qname = %key,
                    addrs = resolution.addrs.len(),
                    ttl = resolution.ttl,
                    upstream_ns = dur.as_nanos() as u64,
                    "upstream call latency"
                );
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if let ResolveError::UpstreamError { code } = err {
                    self.last_error_code.store(u32::from(*code), Ordering::Relaxed);
                }
                warn!(
                    upstream = %self.backend.label(),
                    qname = %key,
                    error = %err,
                    elapsed_ns = dur.as_nanos() as u64,
                    "upstream call failed"
                );
            }
        }
        res
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Mean latency of successful calls.
    pub fn avg_latency(&self) -> Duration {
        let ok = self.calls().saturating_sub(self.failures());
        if ok == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.upstream_ns_total.load(Ordering::Relaxed) / ok)
    }

    pub fn last_error_code(&self) -> Option<u16> {
        match self.last_error_code.load(Ordering::Relaxed) {
            0 => None,
            code => u16::try_from(code).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddressSet;
    use std::net::Ipv4Addr;

    struct Fixed(Result<Resolution, ResolveError>, &'static str);

    #[async_trait]
    impl Backend for Fixed {
        fn label(&self) -> &str {
            self.1
        }

        async fn resolve(&self, _key: &QueryKey) -> Result<Resolution, ResolveError> {
            self.0.clone()
        }
    }

    fn ok(ttl: u32) -> Result<Resolution, ResolveError> {
        Ok(Resolution {
            addrs: AddressSet::V4(vec![Ipv4Addr::new(192, 0, 2, 1)].into()),
            ttl,
        })
    }

    fn policy() -> TtlPolicy {
        TtlPolicy {
            min_ttl: 60,
            max_ttl: 3600,
            prefetch: true,
            threshold_percent: 10,
        }
    }

    #[tokio::test]
    async fn upstream_clamps_ttl_into_range() {
        let key = QueryKey::new("a.test").unwrap();
        let low = Upstream::new(Arc::new(Fixed(ok(5), "low")), policy());
        assert_eq!(low.fetch(&key).await.unwrap().ttl, 60);
        let high = Upstream::new(Arc::new(Fixed(ok(999_999), "high")), policy());
        assert_eq!(high.fetch(&key).await.unwrap().ttl, 3600);
        assert_eq!(high.calls(), 1);
    }

    #[tokio::test]
    async fn upstream_rejects_empty_sets_and_records_error_codes() {
        let key = QueryKey::new("a.test").unwrap();
        let empty = Upstream::new(
            Arc::new(Fixed(
                Ok(Resolution {
                    addrs: AddressSet::V4(Vec::new().into()),
                    ttl: 300,
                }),
                "empty",
            )),
            policy(),
        );
        assert!(matches!(empty.fetch(&key).await, Err(ResolveError::NoAnswer(_))));

        let failing = Upstream::new(
            Arc::new(Fixed(Err(ResolveError::UpstreamError { code: 502 }), "bad")),
            policy(),
        );
        assert!(failing.fetch(&key).await.is_err());
        assert_eq!(failing.failures(), 1);
        assert_eq!(failing.last_error_code(), Some(502));
    }

    #[tokio::test]
    async fn fallback_used_only_when_primary_fails() {
        let key = QueryKey::new("a.test").unwrap();
        let chain = Fallback::new(
            Arc::new(Fixed(Err(ResolveError::Timeout(Duration::from_secs(1))), "http")),
            Arc::new(Fixed(ok(42), "dns")),
            Duration::from_secs(2),
        );
        assert_eq!(chain.label(), "http+dns");
        assert_eq!(chain.resolve(&key).await.unwrap().ttl, 42);

        let both_fail = Fallback::new(
            Arc::new(Fixed(Err(ResolveError::NoAnswer("a.test".into())), "http")),
            Arc::new(Fixed(Err(ResolveError::UpstreamError { code: 2 }), "dns")),
            Duration::from_secs(2),
        );
        assert_eq!(
            both_fail.resolve(&key).await,
            Err(ResolveError::UpstreamError { code: 2 })
        );
    }

    /// Fails with `Timeout` only after sleeping its full budget.
    struct Hanging(Duration);

    #[async_trait]
    impl Backend for Hanging {
        fn label(&self) -> &str {
            "hanging"
        }

        async fn resolve(&self, _key: &QueryKey) -> Result<Resolution, ResolveError> {
            tokio::time::sleep(self.0).await;
            Err(ResolveError::Timeout(self.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_chain_shares_one_deadline() {
        let key = QueryKey::new("a.test").unwrap();
        let budget = Duration::from_secs(2);
        let chain = Fallback::new(
            Arc::new(Hanging(budget)),
            Arc::new(Hanging(budget)),
            budget,
        );
        let start = Instant::now();
        assert_eq!(chain.resolve(&key).await, Err(ResolveError::Timeout(budget)));
        assert_eq!(start.elapsed(), budget);
    }

    #[tokio::test]
    async fn with_deadline_maps_expiry_to_timeout() {
        let budget = Duration::from_millis(20);
        let res: Result<(), ResolveError> = with_deadline(Instant::now() + budget, budget, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(ResolveError::Timeout(budget)));
    }
}
