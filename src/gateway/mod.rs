//! Gateway Router: the single entry point of the library.
//!
//! # Data Flow
//! ```text
//! forward(ctx, directive)
//!     → ensure ServiceHandle (first resolution + background loops if new)
//!     → Deadline (directive deadline, tightened by the caller's)
//!     → ReplayableBody (buffer only when retries are possible)
//!     → RetryExecutor
//!         → ServiceHandle::select (healthy ∩ breaker-selectable, LB pick, permit)
//!         → ProxyForwarder::send (bounded by the attempt budget)
//!         → TargetLease::report (breaker + pool bookkeeping)
//!     → relayed response or classified GatewayError
//! ```
//!
//! # Design Decisions
//! - One ServiceHandle per service key, shared by every directive naming it;
//!   the first registration fixes pool, breaker and health settings
//! - Pool, health and breaker internals never leave this module's API

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::Response;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::validation::validate_directive;
use crate::config::ProxyDirective;
use crate::discovery::{DiscoveryError, Refresher, ResolverRegistry};
use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthChecker;
use crate::http::forwarder::{annotate, OutboundTemplate, ProxyForwarder, ReplayableBody};
use crate::http::request::RequestContext;
use crate::http::response::error_response;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::{Deadline, RetryExecutor, RetryPolicy};

mod service;

pub use service::{ServiceHandle, TargetLease};

#[derive(Debug)]
pub struct Gateway {
    services: DashMap<String, Arc<ServiceHandle>>,
    resolvers: ResolverRegistry,
    forwarder: ProxyForwarder,
    shutdown: Shutdown,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    /// Gateway with the built-in discovery backends.
    pub fn new() -> Self {
        Self::with_parts(ResolverRegistry::default(), Shutdown::new())
    }

    pub fn with_parts(resolvers: ResolverRegistry, shutdown: Shutdown) -> Self {
        Self {
            services: DashMap::new(),
            resolvers,
            forwarder: ProxyForwarder::new(),
            shutdown,
        }
    }

    pub fn shutdown_handle(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Stop every refresh and health loop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Handle for the directive's service, if registered.
    pub fn service(&self, directive: &ProxyDirective) -> Option<Arc<ServiceHandle>> {
        self.services
            .get(&directive.service_key())
            .map(|entry| entry.value().clone())
    }

    /// Validate the directive and make sure its service is set up.
    ///
    /// A new service is resolved once before this returns. A failed first
    /// resolution leaves the pool unresolved; the refresh loop keeps trying.
    pub async fn register(&self, directive: &ProxyDirective) -> GatewayResult<Arc<ServiceHandle>> {
        if let Err(errors) = validate_directive(directive) {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::Configuration(message));
        }

        let key = directive.service_key();
        if let Some(existing) = self.services.get(&key) {
            return Ok(existing.value().clone());
        }

        let resolver = self.resolvers.build(directive).map_err(|e| match e {
            DiscoveryError::UnknownBackend(_) | DiscoveryError::InvalidTarget { .. } => {
                GatewayError::Configuration(e.to_string())
            }
            other => GatewayError::Discovery(other),
        })?;

        let handle = Arc::new(ServiceHandle::new(
            key.clone(),
            directive.service_name(),
            directive.circuit_breaker.clone(),
        ));
        let breakers = handle.breakers().clone();
        let refresh_every = resolver.refresh_interval();
        let refresher = Refresher::new(
            resolver.clone(),
            handle.pool().clone(),
            refresh_every.unwrap_or_else(|| directive.refresh_interval()),
        )
        .on_update(move |snapshot| {
            let keys: Vec<String> = snapshot.targets.iter().map(|t| t.key()).collect();
            breakers.retain_targets(keys.iter().map(String::as_str));
        });

        if refresher.refresh().await.is_ok() {
            tracing::info!(
                service = %handle.name(),
                backend = resolver.name(),
                targets = handle.pool().snapshot().map_or(0, |s| s.len()),
                "Service registered"
            );
        }

        let handle = match self.services.entry(key) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => slot.insert(handle).value().clone(),
        };

        if refresh_every.is_some() {
            tokio::spawn(refresher.run(self.shutdown.subscribe()));
        }
        if let Some(checker) = HealthChecker::new(handle.pool().clone(), directive.health_check.clone()) {
            tokio::spawn(checker.run(self.shutdown.subscribe()));
        }
        Ok(handle)
    }

    /// Forward one inbound request according to the directive.
    pub async fn forward(
        &self,
        ctx: RequestContext,
        directive: &ProxyDirective,
    ) -> GatewayResult<Response<Body>> {
        let start = Instant::now();
        let handle = self.register(directive).await?;
        let service = handle.name().to_string();
        let request_id = ctx.request_id.clone();

        let result = self.forward_to(&handle, ctx, directive).await;

        let (outcome, status) = match &result {
            Ok(response) => ("success", response.status().as_u16()),
            Err(e) => (e.kind(), e.status_code().as_u16()),
        };
        metrics::record_request(&service, outcome, status, start);
        match &result {
            Ok(_) => tracing::debug!(
                request_id = %request_id,
                service = %service,
                status,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Request forwarded"
            ),
            Err(GatewayError::Client { .. }) => tracing::debug!(
                request_id = %request_id,
                service = %service,
                status,
                "Upstream rejected request"
            ),
            Err(e) => tracing::warn!(
                request_id = %request_id,
                service = %service,
                error = %e,
                kind = e.kind(),
                "Request failed"
            ),
        }
        result
    }

    async fn forward_to(
        &self,
        handle: &ServiceHandle,
        ctx: RequestContext,
        directive: &ProxyDirective,
    ) -> GatewayResult<Response<Body>> {
        let deadline = Deadline::bounded(directive.deadline(), ctx.deadline);
        let RequestContext {
            method,
            uri,
            version,
            headers,
            body,
            client_addr,
            path_params,
            cancel,
            request_id,
            ..
        } = ctx;

        let mut policy = RetryPolicy::from(&directive.retry);
        let body = ReplayableBody::prepare(
            body,
            policy.attempts,
            directive.max_replay_body_bytes,
            &deadline,
            &cancel,
        )
        .await?;
        if !body.is_replayable() && policy.attempts > 1 {
            tracing::debug!(
                request_id = %request_id,
                limit = directive.max_replay_body_bytes,
                "Request body cannot be replayed, sending a single attempt"
            );
            policy.attempts = 1;
        }

        let template = OutboundTemplate {
            method,
            uri,
            version,
            headers,
            client_addr,
            path_params,
            request_id,
        };
        let client_ip: Option<IpAddr> = client_addr.map(|addr| addr.ip());
        let executor = RetryExecutor::new(policy, handle.name());

        let template = &template;
        let body = &body;
        executor
            .execute(deadline, &cancel, |attempt, deadline| async move {
                let lease = handle.select(client_ip, directive.load_balancer)?;
                let target = lease.target().clone();
                let budget = deadline.attempt_budget(directive.attempt_timeout());

                let request = self.forwarder.build_request(
                    template,
                    &target,
                    directive.path.as_deref(),
                    &directive.headers,
                    body.take().unwrap_or_else(Body::empty),
                )?;
                tracing::debug!(
                    request_id = %template.request_id,
                    target = %target,
                    attempt,
                    budget_ms = budget.as_millis() as u64,
                    "Forwarding attempt"
                );

                let outcome = self.forwarder.send(&target, request, budget).await;
                let state = lease.report(&outcome);
                match outcome {
                    Ok(mut response) => {
                        annotate(&mut response, &target, state);
                        Ok(response)
                    }
                    Err(GatewayError::Client { target: key, status, mut response }) => {
                        annotate(&mut response, &target, state);
                        Err(GatewayError::Client { target: key, status, response })
                    }
                    Err(GatewayError::UpstreamStatus { target: key, status, mut response }) => {
                        annotate(&mut response, &target, state);
                        Err(GatewayError::UpstreamStatus { target: key, status, response })
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Like [`forward`](Self::forward), with terminal errors rendered as
    /// HTTP responses.
    pub async fn handle(&self, ctx: RequestContext, directive: &ProxyDirective) -> Response<Body> {
        let request_id = ctx.request_id.clone();
        match self.forward(ctx, directive).await {
            Ok(response) => response,
            Err(e) => error_response(e, Some(&request_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryResult, Resolver};
    use crate::load_balancer::ServiceTarget;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::time::Duration;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Resolver for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn resolve(&self) -> DiscoveryResult<Vec<ServiceTarget>> {
            Err(DiscoveryError::Catalog {
                backend: "consul",
                service: "users".to_string(),
                message: "connection refused".to_string(),
            })
        }

        fn refresh_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(3600))
        }
    }

    fn context() -> RequestContext {
        RequestContext::from_request(Request::builder().uri("/users").body(Body::empty()).unwrap())
    }

    #[tokio::test]
    async fn test_invalid_directive_is_configuration_error() {
        let gateway = Gateway::new();
        let err = gateway.register(&ProxyDirective::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));

        let directive = ProxyDirective::discovered("users", "zookeeper");
        let err = gateway.register(&directive).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert_eq!(gateway.service_count(), 0);
    }

    #[tokio::test]
    async fn test_directives_share_service() {
        let gateway = Gateway::new();
        let first = ProxyDirective::static_targets(["127.0.0.1:9"]);
        let mut second = first.clone();
        second.retry.attempts = 1;

        let a = gateway.register(&first).await.unwrap();
        let b = gateway.register(&second).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(gateway.service_count(), 1);
        assert_eq!(a.pool().snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_service_is_discovery_error() {
        let mut registry = ResolverRegistry::default();
        registry.register("consul", |_| Ok(Arc::new(Unreachable) as Arc<dyn Resolver>));
        let gateway = Gateway::with_parts(registry, Shutdown::new());

        let directive = ProxyDirective::discovered("users", "consul");
        let err = gateway.forward(context(), &directive).await.unwrap_err();
        assert!(matches!(err, GatewayError::Discovery(DiscoveryError::NotResolved(_))));
        assert_eq!(err.status_code().as_u16(), 503);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let gateway = Gateway::new();
        let directive = ProxyDirective::static_targets(["127.0.0.1:9"]);
        let ctx = context();
        ctx.cancel.cancel();

        let response = gateway.handle(ctx, &directive).await;
        assert_eq!(response.status().as_u16(), 499);
    }
}
