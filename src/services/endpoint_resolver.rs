use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

use crate::config::AgentConfig;
use crate::errors::{AgentError, Result};

const SCHEME: &str = "https";
const SERVICE_LABEL: &str = "_https._tcp";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[async_trait]
pub trait SrvLookup: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>>;
}

pub struct HickorySrvLookup {
    resolver: TokioAsyncResolver,
}

impl HickorySrvLookup {
    pub fn from_system_conf() -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            tracing::warn!("system resolver config unavailable, using defaults: {}", err);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        Self { resolver }
    }
}

#[async_trait]
impl SrvLookup for HickorySrvLookup {
    async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let response = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|err| AgentError::Discovery(err.to_string()))?;
        Ok(response
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointSource {
    Discovered,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub resolved_at: DateTime<Utc>,
    pub source: EndpointSource,
}

/// Caches the catalog base URL discovered through `_https._tcp.<domain>`.
#[derive(Clone)]
pub struct EndpointResolver {
    inner: Arc<EndpointResolverInner>,
}

struct EndpointResolverInner {
    lookup: Arc<dyn SrvLookup>,
    record_name: String,
    api_path: String,
    default_url: String,
    timeout: Duration,
    cache: Mutex<Option<ResolvedEndpoint>>,
    resolve_gate: tokio::sync::Mutex<()>,
    lookups: AtomicU64,
}

impl EndpointResolver {
    pub fn new(
        lookup: Arc<dyn SrvLookup>,
        service_domain: &str,
        api_path: &str,
        default_url: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointResolverInner {
                lookup,
                record_name: format!("{SERVICE_LABEL}.{}", service_domain.trim_end_matches('.')),
                api_path: api_path.trim_matches('/').to_string(),
                default_url: default_url.to_string(),
                timeout,
                cache: Mutex::new(None),
                resolve_gate: tokio::sync::Mutex::new(()),
                lookups: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &AgentConfig, lookup: Arc<dyn SrvLookup>) -> Self {
        Self::new(
            lookup,
            &config.service_domain,
            &config.api_path,
            &config.default_base_url,
            config.discovery_timeout,
        )
    }

    /// Cached URL, or a fresh discovery whose result (fallback included) is cached.
    /// Never fails.
    pub async fn get_base_url(&self) -> String {
        if let Some(hit) = self.cached() {
            return hit.url;
        }

        // Single-flight: late arrivals wait here and reuse the winner's result.
        let _gate = self.inner.resolve_gate.lock().await;
        if let Some(hit) = self.cached() {
            return hit.url;
        }

        let resolved = self.resolve().await;
        let url = resolved.url.clone();
        if let Ok(mut cache) = self.inner.cache.lock() {
            *cache = Some(resolved);
        }
        url
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.inner.cache.lock() {
            if let Some(previous) = cache.take() {
                tracing::info!("endpoint cache cleared (was {})", previous.url);
            }
        }
    }

    pub fn cached(&self) -> Option<ResolvedEndpoint> {
        self.inner.cache.lock().ok().and_then(|cache| cache.clone())
    }

    pub fn lookup_count(&self) -> u64 {
        self.inner.lookups.load(Ordering::SeqCst)
    }

    async fn resolve(&self) -> ResolvedEndpoint {
        self.inner.lookups.fetch_add(1, Ordering::SeqCst);
        let outcome =
            tokio::time::timeout(self.inner.timeout, self.inner.lookup.lookup(&self.inner.record_name))
                .await;

        let discovered = match outcome {
            Ok(Ok(records)) => match select_candidate(&records) {
                Some(best) => Some(build_url(SCHEME, &best.target, best.port, &self.inner.api_path)),
                None => {
                    tracing::warn!(
                        "no SRV candidates for {}, using fallback",
                        self.inner.record_name
                    );
                    None
                }
            },
            Ok(Err(err)) => {
                tracing::warn!(
                    "SRV lookup for {} failed, using fallback: {}",
                    self.inner.record_name,
                    err
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    "SRV lookup for {} timed out after {:?}, using fallback",
                    self.inner.record_name,
                    self.inner.timeout
                );
                None
            }
        };

        match discovered {
            Some(url) => {
                tracing::info!("discovered catalog endpoint {}", url);
                ResolvedEndpoint {
                    url,
                    resolved_at: Utc::now(),
                    source: EndpointSource::Discovered,
                }
            }
            None => ResolvedEndpoint {
                url: self.inner.default_url.clone(),
                resolved_at: Utc::now(),
                source: EndpointSource::Fallback,
            },
        }
    }
}

/// Lowest priority wins; ties go to the highest weight, then to record order.
pub fn select_candidate(records: &[SrvRecord]) -> Option<&SrvRecord> {
    records
        .iter()
        .filter(|record| !record.target.trim_end_matches('.').is_empty())
        .min_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)))
}

pub fn build_url(scheme: &str, target: &str, port: u16, path: &str) -> String {
    let host = target.trim_end_matches('.');
    let default_port = match scheme {
        "http" => 80,
        _ => 443,
    };
    let authority = if port == default_port || port == 0 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{scheme}://{authority}/")
    } else {
        format!("{scheme}://{authority}/{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const FALLBACK: &str = "https://fallback.example.com/api/";

    struct FakeLookup {
        records: Vec<SrvRecord>,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
        last_name: Mutex<Option<String>>,
    }

    impl FakeLookup {
        fn returning(records: Vec<SrvRecord>) -> Arc<Self> {
            Arc::new(Self {
                records,
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_name: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SrvLookup for FakeLookup {
        async fn lookup(&self, name: &str) -> Result<Vec<SrvRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_name.lock().expect("name lock") = Some(name.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(AgentError::Discovery("NXDOMAIN".to_string()));
            }
            Ok(self.records.clone())
        }
    }

    fn record(priority: u16, weight: u16, port: u16, target: &str) -> SrvRecord {
        SrvRecord {
            priority,
            weight,
            port,
            target: target.to_string(),
        }
    }

    fn resolver(lookup: Arc<FakeLookup>) -> EndpointResolver {
        EndpointResolver::new(
            lookup,
            "store.example.com",
            "api",
            FALLBACK,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn candidate_selection_prefers_priority_then_weight() {
        let records = vec![
            record(20, 100, 443, "low.example.com."),
            record(10, 5, 443, "light.example.com."),
            record(10, 50, 8443, "heavy.example.com."),
        ];
        let best = select_candidate(&records).expect("candidate");
        assert_eq!(best.target, "heavy.example.com.");
        assert!(select_candidate(&[]).is_none());
    }

    #[test]
    fn url_omits_default_port_and_trailing_dot() {
        assert_eq!(
            build_url("https", "api.example.com.", 443, "api"),
            "https://api.example.com/api/"
        );
        assert_eq!(
            build_url("https", "api.example.com", 8443, "/v2/"),
            "https://api.example.com:8443/v2/"
        );
        assert_eq!(build_url("http", "h.example.com", 80, ""), "http://h.example.com/");
    }

    #[tokio::test]
    async fn discovered_endpoint_is_cached_until_cleared() {
        let lookup = FakeLookup::returning(vec![record(1, 1, 8443, "api.store.example.com.")]);
        let resolver = resolver(lookup.clone());

        let url = resolver.get_base_url().await;
        assert_eq!(url, "https://api.store.example.com:8443/api/");
        assert_eq!(
            lookup.last_name.lock().expect("name").as_deref(),
            Some("_https._tcp.store.example.com")
        );
        assert_eq!(resolver.get_base_url().await, url);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        resolver.clear_cache();
        resolver.get_base_url().await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_records_fall_back_and_cache_the_default() {
        let lookup = FakeLookup::returning(Vec::new());
        let resolver = resolver(lookup.clone());

        assert_eq!(resolver.get_base_url().await, FALLBACK);
        assert_eq!(
            resolver.cached().map(|hit| hit.source),
            Some(EndpointSource::Fallback)
        );
        assert_eq!(resolver.get_base_url().await, FALLBACK);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_errors_and_timeouts_degrade_to_fallback() {
        let failing = Arc::new(FakeLookup {
            records: Vec::new(),
            fail: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_name: Mutex::new(None),
        });
        assert_eq!(resolver(failing).get_base_url().await, FALLBACK);

        let slow = Arc::new(FakeLookup {
            records: vec![record(1, 1, 443, "never.example.com.")],
            fail: false,
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
            last_name: Mutex::new(None),
        });
        assert_eq!(resolver(slow).get_base_url().await, FALLBACK);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_lookup() {
        let lookup = Arc::new(FakeLookup {
            records: vec![record(1, 1, 443, "api.example.com.")],
            fail: false,
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
            last_name: Mutex::new(None),
        });
        let resolver = resolver(lookup.clone());

        let (a, b) = tokio::join!(resolver.get_base_url(), resolver.get_base_url());
        assert_eq!(a, b);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.lookup_count(), 1);
    }
}
