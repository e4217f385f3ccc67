//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyDirective
//!     → ResolverRegistry::build (factory keyed by backend name)
//!     → Resolver variant:
//!         - static_list.rs (fixed list, never fails at runtime)
//!         - dns.rs (SRV or A/AAAA, TTL cache, stale grace)
//!         - consul.rs (health API, passing instances only)
//!         - kubernetes.rs (Endpoints object, ready/not-ready)
//!     → Vec<ServiceTarget>
//!     → refresher.rs swaps the TargetPool snapshot on each cycle
//! ```
//!
//! # Design Decisions
//! - One capability (`resolve`), variants registered by name; new backends
//!   plug in through `ResolverRegistry::register`
//! - Refresh failures keep the last-good pool
//! - Resolvers build fresh targets each time; health bookkeeping is carried
//!   over by the pool, not by the resolver

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ProxyDirective;
use crate::load_balancer::ServiceTarget;

pub mod consul;
pub mod dns;
pub mod kubernetes;
pub mod refresher;
pub mod static_list;

pub use refresher::Refresher;

/// Errors raised by discovery backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiscoveryError {
    #[error("service '{0}' has not been resolved yet")]
    NotResolved(String),

    #[error("DNS lookup for '{name}' failed: {message}")]
    Dns { name: String, message: String },

    #[error("{backend} catalog query for '{service}' failed: {message}")]
    Catalog {
        backend: &'static str,
        service: String,
        message: String,
    },

    #[error("unknown discovery backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Turns a logical service (or static list) into concrete targets.
#[async_trait]
pub trait Resolver: Send + Sync + Debug {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Resolve the current target set.
    async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>>;

    /// How often the pool should be refreshed. `None` means never.
    fn refresh_interval(&self) -> Option<Duration>;
}

/// Builds a resolver for a directive.
pub type ResolverFactory =
    Arc<dyn Fn(&ProxyDirective) -> DiscoveryResult<Arc<dyn Resolver>> + Send + Sync>;

/// Discovery backends keyed by name.
#[derive(Clone)]
pub struct ResolverRegistry {
    factories: HashMap<String, ResolverFactory>,
}

impl Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ResolverRegistry").field("backends", &names).finish()
    }
}

impl ResolverRegistry {
    /// A registry without any backend.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) a backend.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ProxyDirective) -> DiscoveryResult<Arc<dyn Resolver>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the resolver the directive asks for.
    pub fn build(&self, directive: &ProxyDirective) -> DiscoveryResult<Arc<dyn Resolver>> {
        let name = directive.discovery_backend();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DiscoveryError::UnknownBackend(name.to_string()))?;
        factory(directive)
    }
}

impl Default for ResolverRegistry {
    /// Static, DNS, Consul, and Kubernetes (also as `k8s`).
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("static", |d| {
            Ok(Arc::new(static_list::StaticResolver::from_directive(d)?) as Arc<dyn Resolver>)
        });
        registry.register("dns", |d| {
            Ok(Arc::new(dns::DnsResolver::from_directive(d)?) as Arc<dyn Resolver>)
        });
        registry.register("consul", |d| {
            Ok(Arc::new(consul::ConsulResolver::from_directive(d)?) as Arc<dyn Resolver>)
        });
        let k8s_factory = |d: &ProxyDirective| -> DiscoveryResult<Arc<dyn Resolver>> {
            Ok(Arc::new(kubernetes::KubernetesResolver::from_directive(d)?) as Arc<dyn Resolver>)
        };
        registry.register("kubernetes", k8s_factory);
        registry.register("k8s", k8s_factory);
        registry
    }
}

/// Service name of a discovered directive.
pub(crate) fn required_service(directive: &ProxyDirective) -> DiscoveryResult<String> {
    directive
        .service
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DiscoveryError::InvalidTarget {
            target: String::new(),
            reason: format!("{} discovery requires a service name", directive.discovery_backend()),
        })
}
