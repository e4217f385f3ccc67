//! Per-service state: pool, breakers, balancers, and target selection.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::{CircuitBreakerConfig, LoadBalancerKind};
use crate::discovery::DiscoveryError;
use crate::error::{GatewayError, GatewayResult};
use crate::load_balancer::{self, Candidates, InFlightGuard, LoadBalancer, ServiceTarget, TargetPool};
use crate::resilience::{BreakerPermit, BreakerRegistry, BreakerState, CircuitBreaker};

/// Everything the gateway keeps for one logical service key.
#[derive(Debug)]
pub struct ServiceHandle {
    key: String,
    name: String,
    pool: Arc<TargetPool>,
    breakers: Arc<BreakerRegistry>,
    balancers: DashMap<LoadBalancerKind, Arc<dyn LoadBalancer>>,
}

impl ServiceHandle {
    pub fn new(key: impl Into<String>, name: impl Into<String>, breaker: CircuitBreakerConfig) -> Self {
        let name = name.into();
        Self {
            key: key.into(),
            pool: Arc::new(TargetPool::new(name.clone())),
            breakers: Arc::new(BreakerRegistry::new(name.clone(), breaker)),
            name,
            balancers: DashMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<TargetPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    fn balancer(&self, kind: LoadBalancerKind) -> Arc<dyn LoadBalancer> {
        self.balancers
            .entry(kind)
            .or_insert_with(|| load_balancer::build(kind))
            .clone()
    }

    /// Pick a target and claim its breaker for one attempt.
    ///
    /// Unhealthy targets are never offered. Targets whose breaker refuses the
    /// claim are dropped from the candidate set and selection runs again.
    pub fn select(&self, client: Option<IpAddr>, kind: LoadBalancerKind) -> GatewayResult<TargetLease> {
        let snapshot = self
            .pool
            .snapshot()
            .ok_or_else(|| DiscoveryError::NotResolved(self.name.clone()))?;

        let healthy: Vec<Arc<ServiceTarget>> = snapshot
            .targets
            .iter()
            .filter(|t| t.is_available())
            .cloned()
            .collect();
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyTargets {
                service: self.name.clone(),
            });
        }

        let mut eligible: Vec<Arc<ServiceTarget>> = healthy
            .iter()
            .filter(|t| self.breakers.breaker_for(&t.key()).is_selectable())
            .cloned()
            .collect();
        let balancer = self.balancer(kind);

        loop {
            let candidates = Candidates::new(&healthy, &eligible);
            let Some(target) = balancer.select(&candidates, client) else {
                break;
            };
            let breaker = self.breakers.breaker_for(&target.key());
            match breaker.try_acquire() {
                Ok(permit) => {
                    tracing::debug!(
                        service = %self.name,
                        target = %target,
                        trial = permit.is_trial(),
                        "Target selected"
                    );
                    return Ok(TargetLease {
                        in_flight: target.begin_request(),
                        target,
                        breaker,
                        permit: Some(permit),
                        pool: self.pool.clone(),
                    });
                }
                Err(_) => eligible.retain(|t| !Arc::ptr_eq(t, &target)),
            }
        }

        if eligible.is_empty() {
            let retry_after = healthy
                .iter()
                .map(|t| self.breakers.breaker_for(&t.key()).retry_after())
                .min()
                .unwrap_or(Duration::ZERO);
            tracing::debug!(
                service = %self.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Every healthy target is behind an open circuit"
            );
            return Err(GatewayError::CircuitOpen {
                service: self.name.clone(),
                retry_after,
            });
        }

        // Eligible targets remain but the balancer chose none (all weights zero).
        Err(GatewayError::NoHealthyTargets {
            service: self.name.clone(),
        })
    }
}

/// A claimed target for one attempt. Holds the in-flight count and the
/// breaker permit until the outcome is reported.
#[derive(Debug)]
pub struct TargetLease {
    target: Arc<ServiceTarget>,
    breaker: Arc<CircuitBreaker>,
    permit: Option<BreakerPermit>,
    pool: Arc<TargetPool>,
    in_flight: InFlightGuard,
}

impl TargetLease {
    pub fn target(&self) -> &Arc<ServiceTarget> {
        &self.target
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }

    /// Feed the attempt's outcome into the breaker and the pool.
    ///
    /// 4xx counts as success for the target. Cancellation is neither: the
    /// permit is released without an outcome.
    pub fn report<T>(mut self, outcome: &GatewayResult<T>) -> BreakerState {
        let success = match outcome {
            Ok(_) | Err(GatewayError::Client { .. }) => Some(true),
            Err(e) if e.is_retryable() => Some(false),
            Err(_) => None,
        };

        let Some(permit) = self.permit.take() else {
            return self.breaker.state();
        };
        match success {
            Some(true) => {
                self.pool.mark(&self.target.key(), true);
                permit.record_success()
            }
            Some(false) => {
                self.pool.mark(&self.target.key(), false);
                permit.record_failure()
            }
            None => {
                drop(permit);
                self.breaker.state()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::HealthState;
    use axum::http::StatusCode;

    fn handle(threshold: u32) -> ServiceHandle {
        let handle = ServiceHandle::new(
            "static:a,b",
            "users",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: 60_000,
                ..CircuitBreakerConfig::default()
            },
        );
        handle.pool().update(vec![
            ServiceTarget::new("10.0.0.1", 80),
            ServiceTarget::new("10.0.0.2", 80),
        ]);
        handle
    }

    fn upstream_failure(target: &str) -> GatewayResult<()> {
        Err(GatewayError::Upstream {
            target: target.to_string(),
            message: "connection refused".to_string(),
        })
    }

    #[test]
    fn test_unresolved_pool() {
        let handle = ServiceHandle::new("dns:users", "users", CircuitBreakerConfig::default());
        let err = handle.select(None, LoadBalancerKind::RoundRobin).unwrap_err();
        assert!(matches!(err, GatewayError::Discovery(DiscoveryError::NotResolved(_))));
    }

    #[test]
    fn test_unhealthy_excluded() {
        let handle = handle(5);
        let snapshot = handle.pool().snapshot().unwrap();
        snapshot.targets[0].record_probe(false, 1, 1);

        for _ in 0..4 {
            let lease = handle.select(None, LoadBalancerKind::RoundRobin).unwrap();
            assert_eq!(lease.target().key(), "10.0.0.2:80");
        }

        snapshot.targets[1].record_probe(false, 1, 1);
        let err = handle.select(None, LoadBalancerKind::RoundRobin).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyTargets { .. }));
        assert_eq!(snapshot.targets[1].health(), HealthState::Unhealthy);
    }

    #[test]
    fn test_open_breakers_yield_circuit_open() {
        let handle = handle(1);
        for _ in 0..2 {
            let lease = handle.select(None, LoadBalancerKind::RoundRobin).unwrap();
            let key = lease.target().key();
            assert_eq!(lease.report(&upstream_failure(&key)), BreakerState::Open);
        }

        match handle.select(None, LoadBalancerKind::RoundRobin).unwrap_err() {
            GatewayError::CircuitOpen { retry_after, .. } => {
                assert!(retry_after > Duration::from_secs(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_target_skipped() {
        let handle = handle(1);
        let lease = handle.select(None, LoadBalancerKind::RoundRobin).unwrap();
        let failed = lease.target().key();
        lease.report(&upstream_failure(&failed));

        for _ in 0..4 {
            let lease = handle.select(None, LoadBalancerKind::RoundRobin).unwrap();
            assert_ne!(lease.target().key(), failed);
            lease.report(&Ok(()));
        }
    }

    #[test]
    fn test_client_error_counts_as_success() {
        let handle = handle(1);
        let lease = handle.select(None, LoadBalancerKind::RoundRobin).unwrap();
        let key = lease.target().key();
        let outcome: GatewayResult<()> = Err(GatewayError::Client {
            target: key.clone(),
            status: StatusCode::NOT_FOUND,
            response: Default::default(),
        });
        assert_eq!(lease.report(&outcome), BreakerState::Closed);
        assert_eq!(handle.pool().snapshot().unwrap().get(&key).unwrap().consecutive_successes(), 1);
    }

    #[test]
    fn test_ip_hash_stable_when_mapped_target_unhealthy() {
        let handle = ServiceHandle::new("static:c", "users", CircuitBreakerConfig::default());
        handle.pool().update(vec![
            ServiceTarget::new("10.9.0.1", 80),
            ServiceTarget::new("10.9.0.2", 80),
            ServiceTarget::new("10.9.0.3", 80),
        ]);
        let client: IpAddr = "192.0.2.10".parse().unwrap();

        let mapped = handle.select(Some(client), LoadBalancerKind::IpHash).unwrap().target().clone();
        mapped.record_probe(false, 1, 1);

        let picks: std::collections::HashSet<String> = (0..6)
            .map(|_| handle.select(Some(client), LoadBalancerKind::IpHash).unwrap().target().key())
            .collect();
        assert_eq!(picks.len(), 1, "picks={picks:?}");
        assert!(!picks.contains(&mapped.key()));
    }

    #[test]
    fn test_lease_tracks_in_flight() {
        let handle = handle(5);
        let lease = handle.select(None, LoadBalancerKind::LeastConnections).unwrap();
        assert_eq!(lease.in_flight(), 1);
        let second = handle.select(None, LoadBalancerKind::LeastConnections).unwrap();
        assert_ne!(second.target().key(), lease.target().key());

        let target = lease.target().clone();
        lease.report(&Ok(()));
        assert_eq!(target.in_flight(), 0);
    }
}
