//! DNS discovery.
//!
//! Names starting with `_` (e.g. `_http._tcp.users.svc.example`) are looked
//! up as SRV records, which carry port and weight. Anything else is an
//! A/AAAA lookup paired with the directive's `dns_port`.
//!
//! Answers are cached until their TTL expires. When a lookup fails, the
//! cached answer keeps being served for one refresh interval past its TTL
//! before the error is surfaced.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::time::Instant;

use crate::config::ProxyDirective;
use crate::discovery::{required_service, DiscoveryError, DiscoveryResult, Resolver};
use crate::load_balancer::ServiceTarget;

/// One resolved record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// Last successful answer.
#[derive(Debug, Clone)]
pub struct DnsCache {
    records: Vec<DnsRecord>,
    valid_until: Instant,
}

impl DnsCache {
    pub fn new(records: Vec<DnsRecord>, ttl: Duration) -> Self {
        Self {
            records,
            valid_until: Instant::now() + ttl,
        }
    }

    /// TTL has not expired.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.valid_until
    }

    /// Expired, but still inside the grace period after the TTL.
    pub fn is_usable_stale(&self, now: Instant, grace: Duration) -> bool {
        now < self.valid_until + grace
    }

    pub fn targets(&self) -> Vec<ServiceTarget> {
        self.records
            .iter()
            .map(|r| ServiceTarget::new(r.host.clone(), r.port).with_weight(r.weight))
            .collect()
    }
}

/// Answers one DNS question. Returns the records and their TTL.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// SRV lookup for `_`-prefixed names, A/AAAA paired with `port` otherwise.
    async fn lookup(&self, name: &str, port: u16) -> Result<(Vec<DnsRecord>, Duration), String>;
}

/// System resolver backed lookups.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn from_system_conf() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                tracing::warn!(error = %e, "No usable system DNS config, using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { resolver }
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup(&self, name: &str, port: u16) -> Result<(Vec<DnsRecord>, Duration), String> {
        if is_srv_name(name) {
            let answer = self.resolver.srv_lookup(name).await.map_err(|e| e.to_string())?;
            let ttl = answer
                .as_lookup()
                .valid_until()
                .saturating_duration_since(std::time::Instant::now());
            let records = answer
                .iter()
                .map(|srv| DnsRecord {
                    host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                    port: srv.port(),
                    weight: u32::from(srv.weight()),
                })
                .collect();
            Ok((records, ttl))
        } else {
            let answer = self.resolver.lookup_ip(name).await.map_err(|e| e.to_string())?;
            let ttl = answer
                .valid_until()
                .saturating_duration_since(std::time::Instant::now());
            let records = answer
                .iter()
                .map(|ip| DnsRecord {
                    host: ip.to_string(),
                    port,
                    weight: 1,
                })
                .collect();
            Ok((records, ttl))
        }
    }
}

fn is_srv_name(name: &str) -> bool {
    name.starts_with('_')
}

pub struct DnsResolver {
    name: String,
    port: u16,
    refresh: Duration,
    lookup: Arc<dyn DnsLookup>,
    cache: Mutex<Option<DnsCache>>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

impl DnsResolver {
    pub fn from_directive(directive: &ProxyDirective) -> DiscoveryResult<Self> {
        Self::with_lookup(directive, Arc::new(HickoryLookup::from_system_conf()))
    }

    pub fn with_lookup(directive: &ProxyDirective, lookup: Arc<dyn DnsLookup>) -> DiscoveryResult<Self> {
        Ok(Self {
            name: required_service(directive)?,
            port: directive.dns_port,
            refresh: directive.refresh_interval(),
            lookup,
            cache: Mutex::new(None),
        })
    }

    fn is_srv(&self) -> bool {
        is_srv_name(&self.name)
    }

    fn cached(&self) -> Option<DnsCache> {
        self.cache.lock().ok().and_then(|c| c.clone())
    }

    fn store(&self, cache: DnsCache) {
        if let Ok(mut slot) = self.cache.lock() {
            *slot = Some(cache);
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>> {
        let now = Instant::now();
        if let Some(cache) = self.cached().filter(|c| c.is_fresh(now)) {
            return Ok(cache.targets());
        }

        match self.lookup.lookup(&self.name, self.port).await {
            Ok((records, ttl)) => {
                tracing::debug!(name = %self.name, records = records.len(), ttl_secs = ttl.as_secs(), "DNS lookup succeeded");
                let cache = DnsCache::new(records, ttl);
                let targets = cache.targets();
                self.store(cache);
                Ok(targets)
            }
            Err(message) => match self.cached().filter(|c| c.is_usable_stale(now, self.refresh)) {
                Some(stale) => {
                    tracing::warn!(name = %self.name, error = %message, "DNS lookup failed, serving stale answer");
                    Ok(stale.targets())
                }
                None => Err(DiscoveryError::Dns {
                    name: self.name.clone(),
                    message,
                }),
            },
        }
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh)
    }
}
